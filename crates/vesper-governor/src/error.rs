//! Error types for resource governance

use thiserror::Error;

/// Result type for governance operations
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Errors that can occur while admitting, evicting or persisting resources
#[derive(Debug, Error)]
pub enum GovernorError {
    /// Allocation cannot fit even after eviction
    #[error("Allocation rejected: requested {requested} bytes, {available} of {max} available")]
    AllocationRejected {
        requested: u64,
        available: u64,
        max: u64,
    },

    /// Write would breach the storage quota
    #[error("Quota exceeded: requested {requested} bytes with {used} of {total} used")]
    QuotaExceeded { requested: u64, used: u64, total: u64 },

    /// Durable chunk failed checksum verification
    #[error("Checksum mismatch for {key} chunk {sequence_index}: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch {
        key: String,
        sequence_index: u32,
        expected: u64,
        actual: u64,
    },

    /// Record not present
    #[error("Not found: {0}")]
    NotFound(String),

    /// Gave up waiting for a concurrent transaction on the same key
    #[error("Transaction conflict on {key}: waited {waited_ms}ms")]
    TransactionConflict { key: String, waited_ms: u64 },

    /// Required storage primitive missing or failed to open
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Logical store was not configured
    #[error("Unknown store: {0}")]
    UnknownStore(String),

    /// Manifest and chunks disagree
    #[error("Corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    /// Underlying blob store failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,

    /// Metadata (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GovernorError {
    /// Check if the caller may retry after cleanup or a smaller request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GovernorError::QuotaExceeded { .. }
                | GovernorError::ChecksumMismatch { .. }
                | GovernorError::TransactionConflict { .. }
                | GovernorError::AllocationRejected { .. }
        )
    }

    /// Stable short name, used on the worker wire
    pub fn kind(&self) -> &'static str {
        match self {
            GovernorError::AllocationRejected { .. } => "allocation_rejected",
            GovernorError::QuotaExceeded { .. } => "quota_exceeded",
            GovernorError::ChecksumMismatch { .. } => "checksum_mismatch",
            GovernorError::NotFound(_) => "not_found",
            GovernorError::TransactionConflict { .. } => "transaction_conflict",
            GovernorError::StorageUnavailable(_) => "storage_unavailable",
            GovernorError::UnknownStore(_) => "unknown_store",
            GovernorError::CorruptRecord { .. } => "corrupt_record",
            GovernorError::Backend(_) => "backend",
            GovernorError::InvalidConfig(_) => "invalid_config",
            GovernorError::Cancelled => "cancelled",
            GovernorError::Serialization(_) => "serialization",
            GovernorError::Io(_) => "io",
        }
    }
}
