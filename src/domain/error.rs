// Error taxonomy shared by every layer
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TelemetryError {
    /// Caller supplied an unusable range. Never retried.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Provider answered with a stub or malformed envelope. Retried.
    #[error("incomplete data: {0}")]
    IncompleteData(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected by provider (status {status})")]
    Auth { status: u16 },

    #[error("provider returned status {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("unknown view: {0}")]
    UnknownView(String),
}

impl TelemetryError {
    /// Only incomplete payloads are absorbed by the retry scheduler.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IncompleteData(_))
    }
}
