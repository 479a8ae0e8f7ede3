//! Error types for the worker host

use thiserror::Error;
use vesper_governor::GovernorError;

/// Result type for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors raised by the worker host
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Governance operation failed
    #[error(transparent)]
    Governor(#[from] GovernorError),

    /// Request arrived before `init`
    #[error("Worker not initialized")]
    NotInitialized,

    /// Request or response channel closed
    #[error("Channel error: {0}")]
    ChannelClosed(String),

    /// Worker answered with a different response than the request expects
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Malformed request line
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Stable short name sent in `error` responses
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Governor(e) => e.kind(),
            WorkerError::NotInitialized => "not_initialized",
            WorkerError::ChannelClosed(_) => "channel_closed",
            WorkerError::UnexpectedResponse(_) => "unexpected_response",
            WorkerError::Protocol(_) => "protocol",
            WorkerError::Io(_) => "io",
        }
    }
}
