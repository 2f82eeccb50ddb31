use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("connect {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("serial: {0}")]
    Serial(String),
    #[error("read timed out")]
    Timeout,
    #[error("reply exceeded {0} bytes without terminator")]
    Overflow(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
