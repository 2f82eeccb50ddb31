#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Fridge monitoring core (hardware-agnostic).
//!
//! Everything that decides *what* to upload lives here. Instrument I/O goes
//! through the `cryomon_traits` seams (`Transport`, `HandshakePort`, `Clock`)
//! so tests can script the wire and the clock.
//!
//! ## Architecture
//!
//! - **Cursors**: vendor log-file tailing (`logtail` module)
//! - **Monitors**: BlueFors and Leiden log state machines (`bluefors`, `leiden`)
//! - **Instruments**: serial protocol pollers (`instruments` module)
//! - **Bounce**: compressor pressure oscillation estimate (`bounce` module)
//! - **Upload**: HTTP client with latest-timestamp seeding (`upload` module)
//! - **Scheduling**: retry/backoff and the poller supervisor (`retry`, `scheduler`)

// Module declarations
pub mod bluefors;
pub mod bounce;
pub mod error;
pub mod instruments;
pub mod leiden;
pub mod logtail;
pub mod mocks;
pub mod retry;
pub mod scheduler;
pub mod time;
pub mod upload;

use std::time::Duration;

use crate::error::Result;

/// Outcome of one poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// New data was consumed or uploaded; poll again immediately.
    Advanced,
    /// Nothing new; sleep until the next tick.
    Idle,
}

impl Progress {
    #[must_use]
    pub fn advanced(self) -> bool {
        matches!(self, Self::Advanced)
    }
}

/// One scheduled unit of monitoring. The supervisor drains `poll` until it
/// reports [`Progress::Idle`], then sleeps [`Poller::interval`].
pub trait Poller: Send {
    /// Short name for thread naming and supervisor reports.
    fn name(&self) -> &str;

    /// Consume at most one unit of new data (one log line, one batch of
    /// instrument readings) and upload whatever became due.
    fn poll(&mut self) -> Result<Progress>;

    /// Sleep between idle ticks. Instrument pollers keep the 1 s default and
    /// gate on their upload interval internally.
    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}
