//! Vesper Worker
//!
//! Hosts one resource governor per execution context and exposes it through
//! a typed request/response protocol.
//!
//! ```text
//! caller ──(WorkerRequest, oneshot)──► mpsc ──► worker task
//!                                               │ WorkerContext
//!                                               │  ├─ SharedLedger
//!                                               │  ├─ EphemeralCache
//!                                               │  ├─ PersistentStore
//!                                               │  └─ PipelineOrchestrator
//! caller ◄────────── WorkerResponse ◄───────────┘
//! ```
//!
//! The `vesper-worker` binary speaks the same protocol as JSON lines over
//! stdin/stdout.

mod context;
mod error;
mod host;
mod protocol;

pub use context::{Backends, WorkerContext};
pub use error::{Result, WorkerError};
pub use host::{spawn_worker, WorkerHandle, DEFAULT_QUEUE_DEPTH};
pub use protocol::{WorkerRequest, WorkerResponse};

/// Default shared quota for the built-in backends
pub const DEFAULT_QUOTA_BYTES: u64 = 1024 * 1024 * 1024;
