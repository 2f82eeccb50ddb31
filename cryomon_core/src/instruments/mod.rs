//! Serial-instrument pollers.
//!
//! Each poller owns its connection lifecycle: the first poll connects, a
//! communication failure drops the handle and fails the tick, and the next
//! tick reconnects. The scheduler's backoff paces those reconnect attempts,
//! so a dark instrument costs one jittered retry per attempt instead of a
//! busy loop.
//!
//! Readings are stamped with wall time at the moment of upload; the store's
//! last-stored timestamp doubles as the cadence anchor.

// Module declarations
pub mod avs47;
pub mod cryomech;
pub mod lakeshore;
pub mod maxigauge;
pub mod sample;

pub use avs47::Avs47Monitor;
pub use cryomech::CryomechMonitor;
pub use lakeshore::Lakeshore336Monitor;
pub use maxigauge::MaxiGaugeMonitor;
pub use sample::SampleMonitor;

use chrono::NaiveDateTime;
use cryomon_traits::{HandshakePort, Transport};

use crate::error::{InstrumentError, Result};

/// Opens a fresh connection to an instrument. Called on the first poll and
/// again after any communication failure.
pub type TransportFactory = Box<dyn FnMut() -> Result<Box<dyn Transport + Send>> + Send>;

/// Opens the serial port whose handshake lines drive the resistance bridge.
pub type PortFactory = Box<dyn FnMut() -> Result<Box<dyn HandshakePort + Send>> + Send>;

pub(crate) fn io_err(e: Box<dyn std::error::Error + Send + Sync>) -> eyre::Report {
    InstrumentError::Io(e.to_string()).into()
}

/// An instrument batch is due once more than `interval` has passed since the
/// last stored timestamp.
pub(crate) fn upload_due(
    now: NaiveDateTime,
    latest: NaiveDateTime,
    interval: chrono::Duration,
) -> bool {
    now - latest > interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn due_strictly_after_the_interval() {
        let latest = NaiveDate::from_ymd_opt(2025, 8, 22)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let interval = chrono::Duration::seconds(30);
        assert!(!upload_due(latest, latest, interval));
        assert!(!upload_due(latest + interval, latest, interval));
        assert!(upload_due(
            latest + interval + chrono::Duration::milliseconds(1),
            latest,
            interval
        ));
    }
}
