//! Host storage primitives
//!
//! The governor talks to the host through these traits. In a browser they
//! map onto the Cache API and IndexedDB; natively the [`memory`] and [`fs`]
//! backends stand in for them.
//!
//! | Trait | Browser primitive | Native |
//! |-------|-------------------|--------|
//! | [`EphemeralBlobStore`] | `caches` | [`MemoryEphemeralStore`] |
//! | [`DurableBlobStore`] | `indexedDB` | [`MemoryDurableStore`], [`FsDurableStore`] |
//! | [`QuotaEstimator`](crate::QuotaEstimator) | `navigator.storage.estimate()` | [`ManualQuota`] |

pub mod fs;
pub mod memory;

pub use fs::FsDurableStore;
pub use memory::{ManualQuota, MemoryDurableStore, MemoryEphemeralStore};

use crate::Result;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Response headers stored next to an ephemeral blob
pub type Headers = BTreeMap<String, String>;

/// Blob returned by an ephemeral bucket lookup
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub data: Bytes,
    pub headers: Headers,
}

/// Named cache bucket
#[async_trait::async_trait]
pub trait EphemeralBucket: Send + Sync {
    /// Store or replace a blob
    async fn put(&self, key: &str, blob: Bytes, headers: Headers) -> Result<()>;

    /// Look up a blob
    async fn match_key(&self, key: &str) -> Result<Option<StoredBlob>>;

    /// Remove a blob; `false` if absent
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Short-lived blob storage (browser Cache API)
#[async_trait::async_trait]
pub trait EphemeralBlobStore: Send + Sync {
    /// Open or create a bucket
    async fn open(&self, name: &str) -> Result<Arc<dyn EphemeralBucket>>;

    /// Drop a whole bucket; `false` if it did not exist
    async fn delete_all(&self, name: &str) -> Result<bool>;
}

/// Transaction access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Versioned, transactional durable storage (browser IndexedDB)
#[async_trait::async_trait]
pub trait DurableBlobStore: Send + Sync {
    /// Open a database, creating any missing object stores
    async fn open(
        &self,
        name: &str,
        version: u32,
        stores: &[String],
    ) -> Result<Arc<dyn DurableDatabase>>;
}

/// Open database connection
#[async_trait::async_trait]
pub trait DurableDatabase: Send + Sync {
    /// Begin a transaction over the named object stores
    async fn transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
    ) -> Result<Box<dyn DurableTransaction>>;
}

/// One transaction; dropped without `commit` means aborted
#[async_trait::async_trait]
pub trait DurableTransaction: Send {
    async fn get(&mut self, store: &str, key: &str) -> Result<Option<Bytes>>;

    async fn put(&mut self, store: &str, key: &str, value: Bytes) -> Result<()>;

    async fn delete(&mut self, store: &str, key: &str) -> Result<()>;

    async fn clear(&mut self, store: &str) -> Result<()>;

    async fn keys(&mut self, store: &str) -> Result<Vec<String>>;

    /// Apply every write atomically
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// A buffered write inside a transaction
#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Put { store: String, key: String, value: Bytes },
    Delete { store: String, key: String },
    Clear { store: String },
}

/// Read-your-writes view of the pending ops for one key
///
/// `None` means the ops say nothing about the key; `Some(None)` means it was
/// deleted or cleared inside the transaction.
pub(crate) fn pending_value(ops: &[PendingOp], store: &str, key: &str) -> Option<Option<Bytes>> {
    ops.iter().rev().find_map(|op| match op {
        PendingOp::Put { store: s, key: k, value } if s == store && k == key => {
            Some(Some(value.clone()))
        }
        PendingOp::Delete { store: s, key: k } if s == store && k == key => Some(None),
        PendingOp::Clear { store: s } if s == store => Some(None),
        _ => None,
    })
}

/// Apply pending ops to a key listing
pub(crate) fn pending_keys(ops: &[PendingOp], store: &str, mut keys: Vec<String>) -> Vec<String> {
    for op in ops {
        match op {
            PendingOp::Put { store: s, key, .. } if s == store => {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
            PendingOp::Delete { store: s, key } if s == store => keys.retain(|k| k != key),
            PendingOp::Clear { store: s } if s == store => keys.clear(),
            _ => {}
        }
    }
    keys.sort();
    keys
}
