//! Vesper Resource Governor
//!
//! Memory and storage governance for inference running inside a browser
//! worker (or any host with equivalent primitives): every live numeric
//! buffer, cached frame and persisted blob is accounted for against a fixed
//! budget, and contention is resolved by eviction, retry or rejection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      PipelineOrchestrator                        │
//! │   batch sizing · proactive cleanup · pressure pass · cancel      │
//! ├──────────────────┬──────────────────────┬────────────────────────┤
//! │  ResourceLedger  │    EphemeralCache    │    PersistentStore     │
//! │  byte budget     │    TTL + LRU index   │    chunks + checksums  │
//! │  priority/LRU    │    header checksums  │    per-key locks       │
//! │  eviction        │                      │    per-store gate      │
//! ├──────────────────┴──────────┬───────────┴────────────────────────┤
//! │                             │          QuotaOracle               │
//! │      NumericBuffer          ├────────────────────────────────────┤
//! │      (dispose on evict)     │  EphemeralBlobStore │ DurableBlob- │
//! │                             │  (Cache API)        │ Store (IDB)  │
//! └─────────────────────────────┴─────────────────────┴──────────────┘
//! ```
//!
//! There is no global state: each execution context builds its own ledger,
//! cache, store and orchestrator and passes them by reference.

pub mod backend;
mod cache;
mod config;
mod error;
mod keylock;
mod ledger;
mod pipeline;
mod pressure;
mod quota;
mod store;
mod tensor;

pub use cache::{
    CacheEntry, CacheStats, CachedPayload, CleanupReport, CleanupTask, EphemeralCache,
    PayloadKind, SetOptions,
};
pub use config::{CacheConfig, GovernorConfig, LedgerConfig, PipelineConfig, StoreConfig};
pub use error::{GovernorError, Result};
pub use ledger::{
    AllocationId, Lease, LedgerStats, ResourceLedger, SharedLedger, TrackedAllocation,
};
pub use pipeline::{
    BatchProcessor, CancellationFlag, GovernorStatus, PipelineOrchestrator, PipelineState,
    PressureReport, RunReport, StatusEvent,
};
pub use pressure::{ManualPressure, PressureHandler, PressureSignal, Subscription};
pub use quota::{QuotaEstimate, QuotaEstimator, QuotaOracle, QuotaSnapshot};
pub use store::{
    chunk_key, chunk_store_name, PersistedChunk, PersistentStore, RecordManifest, SaveOptions,
    CHUNK_STORE_SUFFIX,
};
pub use tensor::{DType, HostTensor, NumericBuffer, TensorMeta};

/// Version of the durable database schema
pub const SCHEMA_VERSION: u32 = 1;

/// Priority above which allocations are never evicted by default
pub const DEFAULT_PIN_PRIORITY: i32 = 100;

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        CachedPayload, EphemeralCache, GovernorConfig, GovernorError, PersistentStore,
        PipelineOrchestrator, ResourceLedger, Result, SharedLedger,
    };
}
