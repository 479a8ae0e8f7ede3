//! Worker message protocol
//!
//! Requests and responses are JSON objects tagged by `type`. Byte payloads
//! travel as arrays of numbers.

use serde::{Deserialize, Serialize};
use vesper_governor::{
    AllocationId, CleanupReport, GovernorConfig, GovernorStatus, PressureReport,
};

/// Message sent to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Build the governor for this context
    Init {
        #[serde(default)]
        config: GovernorConfig,
    },
    /// Track a buffer in the ledger
    Track {
        size_bytes: u64,
        #[serde(default)]
        aux_bytes: u64,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        label: Option<String>,
    },
    /// Refresh an allocation's recency
    Touch { id: AllocationId },
    /// Release an allocation
    Release { id: AllocationId },
    /// Evict down to a utilization fraction
    Evict { target: f64 },
    /// Store raw bytes in the ephemeral cache
    CacheSet {
        key: String,
        payload: Vec<u8>,
        #[serde(default)]
        ttl_ms: Option<u64>,
        #[serde(default)]
        priority: i32,
    },
    /// Read raw bytes from the ephemeral cache
    CacheGet { key: String },
    /// Run a cache cleanup pass
    CacheCleanup,
    /// Persist a record
    Save {
        store: String,
        key: String,
        payload: Vec<u8>,
        #[serde(default)]
        chunk_size: Option<usize>,
    },
    /// Read a persisted record
    Load { store: String, key: String },
    /// Delete a persisted record
    Delete { store: String, key: String },
    /// Clear a persisted store
    Clear { store: String },
    /// Simulate a host memory pressure event
    Pressure,
    /// Report resource totals
    Status,
    /// Stop the worker after replying
    Shutdown,
}

/// Message returned by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Initialized,
    Tracked { id: AllocationId },
    Touched { touched: bool },
    Released { released: bool },
    Evicted { count: usize },
    Cached,
    CacheValue { payload: Option<Vec<u8>> },
    CacheCleaned(CleanupReport),
    Saved { generation: u64, chunks: usize },
    Loaded { payload: Vec<u8> },
    Deleted { deleted: bool },
    Cleared { count: usize },
    PressureHandled(PressureReport),
    Status(GovernorStatus),
    ShuttingDown,
    Error { kind: String, message: String },
}

impl WorkerResponse {
    /// Error response from any displayable error with a kind
    pub fn error(kind: &str, message: impl ToString) -> Self {
        WorkerResponse::Error {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, WorkerResponse::Error { .. })
    }
}
