//! Concrete instrument transports: TCP always, serial behind the
//! `serial` feature, and deterministic simulated devices for running
//! without a fridge attached.

pub mod error;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;
pub mod tcp;

pub use error::HwError;
#[cfg(feature = "serial")]
pub use serial::{SerialHandshake, SerialTransport};
pub use sim::{SimAvs47, SimCryomech, SimLakeshore336, SimMaxiGauge};
pub use tcp::TcpTransport;
