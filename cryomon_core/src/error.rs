use thiserror::Error;

/// Errors from the HTTP upload client.
#[derive(Debug, Error, Clone)]
pub enum UploadError {
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected server response: {0}")]
    BadResponse(String),
}

impl UploadError {
    /// A 4xx means the payload itself was rejected; retrying cannot help.
    /// Everything else (5xx, timeouts, connection resets) is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => !(400..500).contains(status),
            Self::Transport(_) | Self::BadResponse(_) => true,
        }
    }
}

/// Errors talking to serial/TCP instruments.
#[derive(Debug, Error, Clone)]
pub enum InstrumentError {
    #[error("io error: {0}")]
    Io(String),
    #[error("timed out waiting for instrument data")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("checksum mismatch in compressor reply")]
    Checksum,
    #[error("reply sequence {got:#04x} does not match request {sent:#04x}")]
    SequenceMismatch { sent: u8, got: u8 },
    #[error("gauge rejected the command (NAK)")]
    Nak,
    #[error("bridge switched from channel {expected} to {found} mid-read")]
    ChannelChanged { expected: u8, found: u8 },
}

/// Whether a failed operation is worth retrying under backoff.
///
/// Unknown errors default to retryable; only errors we positively know to be
/// permanent (a 4xx rejection) stop the retry loop.
pub fn is_retryable(report: &eyre::Report) -> bool {
    if let Some(e) = report.downcast_ref::<UploadError>() {
        return e.is_retryable();
    }
    true
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
