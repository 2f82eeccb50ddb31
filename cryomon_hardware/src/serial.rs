//! serialport-backed implementations of the hardware seams.
//!
//! [`SerialTransport`] carries the byte protocols (Lakeshore, Cryomech,
//! MaxiGauge). [`SerialHandshake`] is for the AVS47 bridge, which has no
//! UART at all: its synchronous interface is wired to the port's RTS, DTR
//! and CTS control lines and bit-banged from software.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use cryomon_traits::{HandshakePort, Transport};
use serialport::SerialPort;

use crate::error::{HwError, Result};

/// No instrument we speak to replies with more than this in one line.
const MAX_REPLY: usize = 4096;
/// Port-level read timeout; deadline handling is done above it.
const READ_SLICE: Duration = Duration::from_millis(50);

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `path` at `baud`, 8N1, no flow control (the VISA serial
    /// defaults every instrument here was deployed with).
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(READ_SLICE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| HwError::Serial(format!("open {path}: {e}")))?;
        tracing::debug!(%path, baud, "serial port open");
        Ok(Self { port })
    }

    fn read_some(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        loop {
            if Instant::now() >= deadline {
                return Err(HwError::Timeout);
            }
            match self.port.read(buf) {
                Ok(0) => {}
                Ok(n) => return Ok(n),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn recv_exact_inner(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; n];
        let mut got = 0;
        while got < n {
            got += self.read_some(&mut buf[got..], deadline)?;
        }
        Ok(buf)
    }

    fn recv_until_inner(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.read_some(&mut byte, deadline)?;
            out.push(byte[0]);
            if byte[0] == terminator {
                return Ok(out);
            }
            if out.len() >= MAX_REPLY {
                return Err(HwError::Overflow(MAX_REPLY));
            }
        }
    }
}

impl Transport for SerialTransport {
    fn send(
        &mut self,
        bytes: &[u8],
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn recv_exact(
        &mut self,
        n: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        self.recv_exact_inner(n, timeout).map_err(Into::into)
    }

    fn recv_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        self.recv_until_inner(terminator, timeout).map_err(Into::into)
    }
}

/// The AVS47's three-wire interface on a serial port's control lines:
/// RTS drives the bridge's clock (CP), DTR its data-in (DC), and the
/// bridge's data-out (DI) arrives on CTS.
pub struct SerialHandshake {
    port: Box<dyn SerialPort>,
}

impl SerialHandshake {
    pub fn open(path: &str) -> Result<Self> {
        // Baud is irrelevant; nothing moves through the UART itself.
        let mut port = serialport::new(path, 9600)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| HwError::Serial(format!("open {path}: {e}")))?;
        port.write_request_to_send(false)
            .map_err(|e| HwError::Serial(e.to_string()))?;
        port.write_data_terminal_ready(false)
            .map_err(|e| HwError::Serial(e.to_string()))?;
        tracing::debug!(%path, "bridge handshake port open");
        Ok(Self { port })
    }
}

impl HandshakePort for SerialHandshake {
    fn set_clock(
        &mut self,
        high: bool,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.port
            .write_request_to_send(high)
            .map_err(|e| HwError::Serial(e.to_string()).into())
    }

    fn set_data(
        &mut self,
        high: bool,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.port
            .write_data_terminal_ready(high)
            .map_err(|e| HwError::Serial(e.to_string()).into())
    }

    fn read_sense(
        &mut self,
    ) -> std::result::Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        self.port
            .read_clear_to_send()
            .map_err(|e| HwError::Serial(e.to_string()).into())
    }
}
