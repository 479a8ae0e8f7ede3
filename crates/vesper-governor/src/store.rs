//! Durable chunked record store
//!
//! Each logical store is backed by two object stores: `<store>` holds one
//! JSON manifest per key and `<store>.chunks` holds the payload chunks under
//! `<key>@<generation>#<index>`. A save writes the new generation's chunks,
//! the manifest and the removal of the previous generation in one
//! transaction, so a reader sees either the old record or the new one.
//!
//! Transactions on the same key are serialized through a per-key lock;
//! `clear` takes a per-store gate exclusively and therefore waits for every
//! in-flight transaction on that store.

use crate::backend::{DurableBlobStore, DurableDatabase, DurableTransaction, TransactionMode};
use crate::config::StoreConfig;
use crate::keylock::{KeyGuard, KeyLocks};
use crate::quota::QuotaOracle;
use crate::{GovernorError, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Suffix of the object store holding a logical store's chunks
pub const CHUNK_STORE_SUFFIX: &str = ".chunks";

/// Object store name for the chunks of `store`
pub fn chunk_store_name(store: &str) -> String {
    format!("{store}{CHUNK_STORE_SUFFIX}")
}

/// Object key of one chunk
pub fn chunk_key(key: &str, generation: u64, sequence_index: u32) -> String {
    format!("{key}@{generation}#{sequence_index}")
}

/// One checksummed slice of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChunk {
    pub parent_key: String,
    pub sequence_index: u32,
    /// xxh3-64 of the chunk bytes
    pub checksum: u64,
    pub byte_length: u64,
}

/// Manifest listing the chunks of one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordManifest {
    pub key: String,
    pub total_length: u64,
    pub chunk_size: u64,
    /// Incremented on every overwrite
    pub generation: u64,
    /// Unix milliseconds
    pub saved_at: u64,
    pub chunks: Vec<PersistedChunk>,
}

/// Per-call options for [`PersistentStore::save`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Overrides the configured chunk size
    pub chunk_size: Option<usize>,
}

impl SaveOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

/// Upper bound on the buffer reserved before reading a record
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Chunked, checksummed durable storage
pub struct PersistentStore {
    database: Arc<dyn DurableDatabase>,
    oracle: QuotaOracle,
    config: StoreConfig,
    gates: HashMap<String, RwLock<()>>,
    key_locks: KeyLocks<(String, String)>,
}

impl fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore")
            .field("database", &self.config.database)
            .field("stores", &self.config.stores)
            .field("key_locks", &self.key_locks.len())
            .finish_non_exhaustive()
    }
}

impl PersistentStore {
    /// Open the configured database and its object stores
    pub async fn open(
        backend: &dyn DurableBlobStore,
        oracle: QuotaOracle,
        config: StoreConfig,
    ) -> Result<Self> {
        let mut object_stores = Vec::with_capacity(config.stores.len() * 2);
        for store in &config.stores {
            object_stores.push(store.clone());
            object_stores.push(chunk_store_name(store));
        }

        let database = backend
            .open(&config.database, config.version, &object_stores)
            .await
            .map_err(|e| match e {
                GovernorError::StorageUnavailable(_) => e,
                other => GovernorError::StorageUnavailable(format!(
                    "failed to open {}: {other}",
                    config.database
                )),
            })?;

        let gates = config
            .stores
            .iter()
            .map(|s| (s.clone(), RwLock::new(())))
            .collect();
        info!(
            "Opened persistent store {} v{} ({} stores)",
            config.database,
            config.version,
            config.stores.len()
        );

        Ok(Self {
            database,
            oracle,
            config,
            gates,
            key_locks: KeyLocks::new(),
        })
    }

    fn gate(&self, store: &str) -> Result<&RwLock<()>> {
        self.gates
            .get(store)
            .ok_or_else(|| GovernorError::UnknownStore(store.to_string()))
    }

    async fn lock_key(&self, store: &str, key: &str) -> Result<KeyGuard<'_, (String, String)>> {
        let started = Instant::now();
        let slot = (store.to_string(), key.to_string());
        match self.key_locks.lock_timeout(slot, self.config.lock_timeout()).await {
            Some(guard) => Ok(guard),
            None => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!("Gave up waiting for {}/{} after {}ms", store, key, waited_ms);
                Err(GovernorError::TransactionConflict {
                    key: key.to_string(),
                    waited_ms,
                })
            }
        }
    }

    async fn admit(&self, bytes: u64) -> Result<()> {
        let snapshot = self.oracle.snapshot().await?;
        if snapshot.utilization() > self.config.quota_admission_ratio || !snapshot.fits(bytes) {
            return Err(GovernorError::QuotaExceeded {
                requested: bytes,
                used: snapshot.used_bytes,
                total: snapshot.total_bytes,
            });
        }
        Ok(())
    }

    /// Write `payload` under `key`, replacing any previous record
    pub async fn save(
        &self,
        store: &str,
        key: &str,
        payload: Bytes,
        options: SaveOptions,
    ) -> Result<RecordManifest> {
        let gate = self.gate(store)?;
        let chunk_size = options.chunk_size.unwrap_or(self.config.chunk_size).max(1);
        self.admit(payload.len() as u64).await?;

        let _gate = gate.read().await;
        let _key = self.lock_key(store, key).await?;

        let chunks_store = chunk_store_name(store);
        let mut tx = self
            .database
            .transaction(&[store, &chunks_store], TransactionMode::ReadWrite)
            .await?;
        let previous = read_manifest(&mut tx, store, key).await?;
        let generation = previous.as_ref().map(|m| m.generation + 1).unwrap_or(1);

        let mut chunks = Vec::with_capacity(payload.len().div_ceil(chunk_size));
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + chunk_size).min(payload.len());
            let piece = payload.slice(offset..end);
            let sequence_index = chunks.len() as u32;
            chunks.push(PersistedChunk {
                parent_key: key.to_string(),
                sequence_index,
                checksum: xxh3_64(&piece),
                byte_length: piece.len() as u64,
            });
            tx.put(&chunks_store, &chunk_key(key, generation, sequence_index), piece)
                .await?;
            offset = end;
        }

        let manifest = RecordManifest {
            key: key.to_string(),
            total_length: payload.len() as u64,
            chunk_size: chunk_size as u64,
            generation,
            saved_at: unix_millis(),
            chunks,
        };
        tx.put(store, key, Bytes::from(serde_json::to_vec(&manifest)?))
            .await?;

        if let Some(previous) = &previous {
            for chunk in &previous.chunks {
                tx.delete(
                    &chunks_store,
                    &chunk_key(key, previous.generation, chunk.sequence_index),
                )
                .await?;
            }
        }
        tx.commit().await?;

        debug!(
            "Saved {}/{} generation {} ({} bytes, {} chunks)",
            store,
            key,
            generation,
            manifest.total_length,
            manifest.chunks.len()
        );
        Ok(manifest)
    }

    /// Read and verify the record under `key`
    ///
    /// A checksum mismatch is retried up to `max_checksum_retries` times
    /// before it is returned.
    pub async fn load(&self, store: &str, key: &str) -> Result<Bytes> {
        let gate = self.gate(store)?;
        let _gate = gate.read().await;
        let _key = self.lock_key(store, key).await?;

        let mut attempt = 0;
        loop {
            match self.read_record(store, key).await {
                Err(e @ GovernorError::ChecksumMismatch { .. })
                    if attempt < self.config.max_checksum_retries =>
                {
                    attempt += 1;
                    warn!(
                        "{} (attempt {}/{})",
                        e, attempt, self.config.max_checksum_retries
                    );
                }
                other => return other,
            }
        }
    }

    async fn read_record(&self, store: &str, key: &str) -> Result<Bytes> {
        let chunks_store = chunk_store_name(store);
        let mut tx = self
            .database
            .transaction(&[store, &chunks_store], TransactionMode::ReadOnly)
            .await?;
        let manifest = read_manifest(&mut tx, store, key)
            .await?
            .ok_or_else(|| GovernorError::NotFound(format!("{store}/{key}")))?;

        let mut chunks = manifest.chunks.clone();
        chunks.sort_by_key(|c| c.sequence_index);

        // The manifest carries no checksum of its own
        let expected: u64 = chunks.iter().map(|c| c.byte_length).sum();
        let mut payload = BytesMut::with_capacity(expected.min(MAX_PREALLOCATION) as usize);
        for (position, chunk) in chunks.iter().enumerate() {
            if chunk.sequence_index as usize != position {
                return Err(GovernorError::CorruptRecord {
                    key: key.to_string(),
                    reason: format!("chunk sequence has a gap at {position}"),
                });
            }
            let data = tx
                .get(
                    &chunks_store,
                    &chunk_key(key, manifest.generation, chunk.sequence_index),
                )
                .await?
                .ok_or_else(|| GovernorError::CorruptRecord {
                    key: key.to_string(),
                    reason: format!("chunk {} missing", chunk.sequence_index),
                })?;

            let actual = xxh3_64(&data);
            if actual != chunk.checksum {
                return Err(GovernorError::ChecksumMismatch {
                    key: key.to_string(),
                    sequence_index: chunk.sequence_index,
                    expected: chunk.checksum,
                    actual,
                });
            }
            payload.extend_from_slice(&data);
        }

        if payload.len() as u64 != manifest.total_length {
            return Err(GovernorError::CorruptRecord {
                key: key.to_string(),
                reason: format!(
                    "expected {} bytes, reassembled {}",
                    manifest.total_length,
                    payload.len()
                ),
            });
        }
        Ok(payload.freeze())
    }

    /// Manifest of `key`, if stored
    pub async fn manifest(&self, store: &str, key: &str) -> Result<Option<RecordManifest>> {
        self.gate(store)?;
        let mut tx = self
            .database
            .transaction(&[store], TransactionMode::ReadOnly)
            .await?;
        read_manifest(&mut tx, store, key).await
    }

    /// Remove the record under `key`; `false` if absent
    pub async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        let gate = self.gate(store)?;
        let _gate = gate.read().await;
        let _key = self.lock_key(store, key).await?;

        let chunks_store = chunk_store_name(store);
        let mut tx = self
            .database
            .transaction(&[store, &chunks_store], TransactionMode::ReadWrite)
            .await?;
        let Some(manifest) = read_manifest(&mut tx, store, key).await? else {
            return Ok(false);
        };
        for chunk in &manifest.chunks {
            tx.delete(
                &chunks_store,
                &chunk_key(key, manifest.generation, chunk.sequence_index),
            )
            .await?;
        }
        tx.delete(store, key).await?;
        tx.commit().await?;

        debug!("Deleted {}/{}", store, key);
        Ok(true)
    }

    pub async fn contains(&self, store: &str, key: &str) -> Result<bool> {
        Ok(self.manifest(store, key).await?.is_some())
    }

    /// Record keys in `store`, sorted
    pub async fn keys(&self, store: &str) -> Result<Vec<String>> {
        self.gate(store)?;
        let mut tx = self
            .database
            .transaction(&[store], TransactionMode::ReadOnly)
            .await?;
        let mut keys = tx.keys(store).await?;
        keys.sort();
        Ok(keys)
    }

    /// Remove every record in `store` once in-flight transactions finish
    pub async fn clear(&self, store: &str) -> Result<usize> {
        let gate = self.gate(store)?;
        let _gate = gate.write().await;

        let chunks_store = chunk_store_name(store);
        let mut tx = self
            .database
            .transaction(&[store, &chunks_store], TransactionMode::ReadWrite)
            .await?;
        let removed = tx.keys(store).await?.len();
        tx.clear(store).await?;
        tx.clear(&chunks_store).await?;
        tx.commit().await?;

        info!("Cleared store {} ({} records)", store, removed);
        Ok(removed)
    }

    /// Drop per-key locks nobody holds or waits on
    ///
    /// Locks are normally freed by their last holder; this sweeps any left
    /// behind.
    pub fn release_idle_locks(&self) -> usize {
        let released = self.key_locks.release_idle();
        if released > 0 {
            debug!("Released {} idle key locks", released);
        }
        released
    }

    /// Per-key locks currently held or awaited
    pub fn lock_count(&self) -> usize {
        self.key_locks.len()
    }

    /// Configured logical stores
    pub fn stores(&self) -> &[String] {
        &self.config.stores
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

async fn read_manifest(
    tx: &mut Box<dyn DurableTransaction>,
    store: &str,
    key: &str,
) -> Result<Option<RecordManifest>> {
    let Some(raw) = tx.get(store, key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| GovernorError::CorruptRecord {
            key: key.to_string(),
            reason: format!("unreadable manifest: {e}"),
        })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
