//! Ephemeral payload cache
//!
//! Short-lived key/payload storage over an [`EphemeralBlobStore`]. The cache
//! keeps its own metadata index for TTL and LRU decisions; payload metadata
//! and an xxh3 checksum travel with each blob in its headers so a corrupted
//! or foreign blob is detected on read.
//!
//! Operations on one key are serialized by a per-key lock, so a blob
//! removal decided by `cleanup` or `get` never lands on a value written by
//! a concurrent `set`.

use crate::backend::{EphemeralBlobStore, EphemeralBucket, Headers};
use crate::config::CacheConfig;
use crate::keylock::KeyLocks;
use crate::quota::QuotaOracle;
use crate::tensor::DType;
use crate::{GovernorError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

const PAYLOAD_HEADER: &str = "x-vesper-payload";
const CHECKSUM_HEADER: &str = "x-vesper-checksum";
const LENGTH_HEADER: &str = "content-length";

/// Discriminant of a [`CachedPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    NumericBuffer,
    Frame,
    RawBytes,
}

/// Value stored in the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CachedPayload {
    /// Raw contents of a numeric buffer
    NumericBuffer {
        shape: Vec<usize>,
        dtype: DType,
        data: Bytes,
    },
    /// Encoded video frame
    Frame {
        width: u32,
        height: u32,
        timestamp_ms: u64,
        data: Bytes,
    },
    /// Opaque bytes
    RawBytes(Bytes),
}

/// Payload metadata carried in the blob headers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PayloadHeader {
    NumericBuffer { shape: Vec<usize>, dtype: DType },
    Frame { width: u32, height: u32, timestamp_ms: u64 },
    RawBytes,
}

impl CachedPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            CachedPayload::NumericBuffer { .. } => PayloadKind::NumericBuffer,
            CachedPayload::Frame { .. } => PayloadKind::Frame,
            CachedPayload::RawBytes(_) => PayloadKind::RawBytes,
        }
    }

    /// Payload bytes
    pub fn data(&self) -> &Bytes {
        match self {
            CachedPayload::NumericBuffer { data, .. }
            | CachedPayload::Frame { data, .. }
            | CachedPayload::RawBytes(data) => data,
        }
    }

    /// Payload size in bytes
    pub fn byte_size(&self) -> u64 {
        self.data().len() as u64
    }

    fn into_parts(self) -> (PayloadHeader, Bytes) {
        match self {
            CachedPayload::NumericBuffer { shape, dtype, data } => {
                (PayloadHeader::NumericBuffer { shape, dtype }, data)
            }
            CachedPayload::Frame {
                width,
                height,
                timestamp_ms,
                data,
            } => (
                PayloadHeader::Frame {
                    width,
                    height,
                    timestamp_ms,
                },
                data,
            ),
            CachedPayload::RawBytes(data) => (PayloadHeader::RawBytes, data),
        }
    }

    fn from_parts(header: PayloadHeader, data: Bytes) -> Self {
        match header {
            PayloadHeader::NumericBuffer { shape, dtype } => {
                CachedPayload::NumericBuffer { shape, dtype, data }
            }
            PayloadHeader::Frame {
                width,
                height,
                timestamp_ms,
            } => CachedPayload::Frame {
                width,
                height,
                timestamp_ms,
                data,
            },
            PayloadHeader::RawBytes => CachedPayload::RawBytes(data),
        }
    }
}

/// Per-entry options for [`EphemeralCache::set`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Overrides the configured default TTL
    pub ttl: Option<Duration>,
    /// Lower values are evicted first
    pub priority: i32,
}

impl SetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Index metadata for one cached key
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub byte_size: u64,
    pub kind: PayloadKind,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub ttl: Duration,
    pub priority: i32,
    pub checksum: u64,
}

impl CacheEntry {
    /// Age strictly beyond the TTL
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Entries removed for TTL expiry
    pub expired: usize,
    /// Entries removed to satisfy the entry and byte limits
    pub evicted: usize,
    /// Bytes removed from the index
    pub bytes_freed: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub integrity_failures: u64,
}

impl CacheStats {
    /// Hit rate over all lookups
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    integrity_failures: AtomicU64,
}

/// TTL/LRU cache over an ephemeral blob store
pub struct EphemeralCache {
    backend: Arc<dyn EphemeralBlobStore>,
    bucket: RwLock<Arc<dyn EphemeralBucket>>,
    oracle: QuotaOracle,
    config: CacheConfig,
    index: Mutex<HashMap<String, CacheEntry>>,
    key_locks: KeyLocks<String>,
    counters: Counters,
}

impl fmt::Debug for EphemeralCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCache")
            .field("name", &self.config.name)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl EphemeralCache {
    /// Open the configured bucket
    pub async fn open(
        backend: Arc<dyn EphemeralBlobStore>,
        oracle: QuotaOracle,
        config: CacheConfig,
    ) -> Result<Self> {
        let bucket = backend.open(&config.name).await?;
        debug!("Opened ephemeral cache {}", config.name);
        Ok(Self {
            backend,
            bucket: RwLock::new(bucket),
            oracle,
            config,
            index: Mutex::new(HashMap::new()),
            key_locks: KeyLocks::new(),
            counters: Counters::default(),
        })
    }

    fn index(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket(&self) -> Arc<dyn EphemeralBucket> {
        self.bucket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store `payload` under `key`, replacing any previous value
    pub async fn set(&self, key: &str, payload: CachedPayload, options: SetOptions) -> Result<()> {
        let kind = payload.kind();
        let (header, data) = payload.into_parts();
        let size = data.len() as u64;
        let replaced = self.index().get(key).map(|e| e.byte_size).unwrap_or(0);
        let needed = size.saturating_sub(replaced);

        let mut snapshot = self.oracle.snapshot().await?;
        if !snapshot.fits(needed) {
            let report = self.cleanup().await?;
            debug!(
                "Cache admission for {} ({} bytes) ran cleanup: {:?}",
                key, size, report
            );
            snapshot = self.oracle.snapshot().await?;
            if !snapshot.fits(needed) {
                return Err(GovernorError::QuotaExceeded {
                    requested: size,
                    used: snapshot.used_bytes,
                    total: snapshot.total_bytes,
                });
            }
        }

        let checksum = xxh3_64(&data);
        let mut headers = Headers::new();
        headers.insert(PAYLOAD_HEADER.into(), serde_json::to_string(&header)?);
        headers.insert(CHECKSUM_HEADER.into(), format!("{checksum:016x}"));
        headers.insert(LENGTH_HEADER.into(), size.to_string());

        let guard = self.key_locks.lock(key.to_string()).await;
        self.bucket().put(key, data, headers).await?;

        let now = Instant::now();
        let over_limits = {
            let mut index = self.index();
            index.insert(
                key.to_string(),
                CacheEntry {
                    key: key.to_string(),
                    byte_size: size,
                    kind,
                    created_at: now,
                    last_accessed_at: now,
                    access_count: 0,
                    ttl: options.ttl.unwrap_or_else(|| self.config.default_ttl()),
                    priority: options.priority,
                    checksum,
                },
            );
            index.len() > self.config.max_entries
                || index.values().map(|e| e.byte_size).sum::<u64>() > self.config.max_bytes
        };
        // Cleanup takes key locks itself
        drop(guard);
        debug!("Cached {} ({} bytes, {:?})", key, size, kind);

        if over_limits {
            self.cleanup().await?;
        }
        Ok(())
    }

    /// Look up `key`
    ///
    /// Returns `None` for a miss, an expired entry or a blob that fails its
    /// integrity check; the latter two are deleted.
    pub async fn get(&self, key: &str) -> Result<Option<CachedPayload>> {
        let _guard = self.key_locks.lock(key.to_string()).await;
        let entry = self.index().get(key).cloned();
        let Some(entry) = entry else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if entry.is_expired(Instant::now()) {
            debug!("Cache entry {} expired", key);
            self.index().remove(key);
            self.bucket().delete(key).await?;
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let Some(blob) = self.bucket().match_key(key).await? else {
            warn!("Cache blob for {} vanished from the bucket", key);
            self.index().remove(key);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        match verify(&entry, &blob.headers, &blob.data) {
            Some(header) => {
                if let Some(live) = self.index().get_mut(key) {
                    live.last_accessed_at = Instant::now();
                    live.access_count += 1;
                }
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CachedPayload::from_parts(header, blob.data)))
            }
            None => {
                warn!("Cache entry {} failed its integrity check", key);
                self.index().remove(key);
                self.bucket().delete(key).await?;
                self.counters.integrity_failures.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Remove `key`; `false` if it was not cached
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.key_locks.lock(key.to_string()).await;
        let indexed = self.index().remove(key).is_some();
        let stored = self.bucket().delete(key).await?;
        Ok(indexed || stored)
    }

    /// Drop every entry and recreate the bucket
    pub async fn clear(&self) -> Result<usize> {
        let dropped = std::mem::take(&mut *self.index()).len();
        self.backend.delete_all(&self.config.name).await?;
        let bucket = self.backend.open(&self.config.name).await?;
        *self.bucket.write().unwrap_or_else(PoisonError::into_inner) = bucket;
        info!("Cleared ephemeral cache {} ({} entries)", self.config.name, dropped);
        Ok(dropped)
    }

    /// Remove expired entries, then least-recently-used ones until within limits
    ///
    /// Victims are chosen from one snapshot of the index. A victim that was
    /// rewritten before its turn came is left alone.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let now = Instant::now();
        let mut report = CleanupReport::default();

        let (expired, evicted) = {
            let index = self.index();

            let expired: Vec<CacheEntry> = index
                .values()
                .filter(|e| e.is_expired(now))
                .cloned()
                .collect();

            let mut live: Vec<&CacheEntry> =
                index.values().filter(|e| !e.is_expired(now)).collect();
            live.sort_by(|a, b| {
                (a.priority, a.last_accessed_at, &a.key).cmp(&(b.priority, b.last_accessed_at, &b.key))
            });

            let mut count = live.len();
            let mut bytes: u64 = live.iter().map(|e| e.byte_size).sum();
            let mut evicted = Vec::new();
            for entry in live {
                if count <= self.config.max_entries && bytes <= self.config.max_bytes {
                    break;
                }
                count -= 1;
                bytes -= entry.byte_size;
                evicted.push(entry.clone());
            }
            (expired, evicted)
        };

        for entry in &expired {
            if self.remove_entry(entry).await {
                report.expired += 1;
                report.bytes_freed += entry.byte_size;
            }
        }
        for entry in &evicted {
            if self.remove_entry(entry).await {
                report.evicted += 1;
                report.bytes_freed += entry.byte_size;
            }
        }
        self.counters
            .expirations
            .fetch_add(report.expired as u64, Ordering::Relaxed);
        self.counters
            .evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);

        if report.expired + report.evicted > 0 {
            info!(
                "Cache cleanup: {} expired, {} evicted, {} bytes freed",
                report.expired, report.evicted, report.bytes_freed
            );
        }
        Ok(report)
    }

    /// Remove `victim` if the index still holds that exact entry
    async fn remove_entry(&self, victim: &CacheEntry) -> bool {
        let _guard = self.key_locks.lock(victim.key.clone()).await;
        {
            let mut index = self.index();
            let unchanged = index.get(&victim.key).is_some_and(|live| {
                live.created_at == victim.created_at && live.checksum == victim.checksum
            });
            if !unchanged {
                debug!("Cache entry {} changed since cleanup began", victim.key);
                return false;
            }
            index.remove(&victim.key);
        }
        if let Err(e) = self.bucket().delete(&victim.key).await {
            warn!("Failed to delete cache blob {}: {}", victim.key, e);
        }
        true
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until the handle drops
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration) -> CleanupTask {
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = cache.cleanup().await {
                    warn!("Periodic cache cleanup failed: {}", e);
                }
            }
        });
        CleanupTask { handle }
    }

    /// Index metadata for `key`
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.index().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index().contains_key(key)
    }

    /// Cached keys in no particular order
    pub fn keys(&self) -> Vec<String> {
        self.index().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    /// Bytes referenced by the index
    pub fn total_bytes(&self) -> u64 {
        self.index().values().map(|e| e.byte_size).sum()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let index = self.index();
            (index.len(), index.values().map(|e| e.byte_size).sum())
        };
        CacheStats {
            entries,
            bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            integrity_failures: self.counters.integrity_failures.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

/// Check a fetched blob against its index entry
fn verify(entry: &CacheEntry, headers: &Headers, data: &Bytes) -> Option<PayloadHeader> {
    let stored = headers
        .get(CHECKSUM_HEADER)
        .and_then(|v| u64::from_str_radix(v, 16).ok())?;
    if stored != entry.checksum || xxh3_64(data) != entry.checksum {
        return None;
    }
    if data.len() as u64 != entry.byte_size {
        return None;
    }
    headers
        .get(PAYLOAD_HEADER)
        .and_then(|v| serde_json::from_str(v).ok())
}

/// Background cleanup task; aborted on drop
#[derive(Debug)]
pub struct CleanupTask {
    handle: JoinHandle<()>,
}

impl CleanupTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
