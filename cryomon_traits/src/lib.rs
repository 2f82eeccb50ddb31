pub mod clock;

pub use clock::{Clock, MonotonicClock};

use std::time::Duration;

/// Byte transport to a serial instrument (Lakeshore, Cryomech, MaxiGauge).
///
/// Implementations own the port; pollers own the connect/reconnect
/// lifecycle. Reads are bounded by an explicit timeout so a wedged
/// instrument cannot stall a poll tick forever.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Read exactly `n` bytes or fail (timeout included).
    fn recv_exact(
        &mut self,
        n: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;

    /// Read up to and including `terminator`, or fail on timeout/overflow.
    fn recv_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).send(bytes)
    }

    fn recv_exact(
        &mut self,
        n: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        (**self).recv_exact(n, timeout)
    }

    fn recv_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        (**self).recv_until(terminator, timeout)
    }
}

/// Three-wire handshake interface used to bit-bang the AVS47 bridge over
/// the control lines of a serial port: a clock line and a data-out line we
/// drive, and a sense line we read.
pub trait HandshakePort {
    fn set_clock(&mut self, high: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn set_data(&mut self, high: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn read_sense(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;
}

impl<P: HandshakePort + ?Sized> HandshakePort for Box<P> {
    fn set_clock(&mut self, high: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set_clock(high)
    }

    fn set_data(&mut self, high: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set_data(high)
    }

    fn read_sense(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        (**self).read_sense()
    }
}
