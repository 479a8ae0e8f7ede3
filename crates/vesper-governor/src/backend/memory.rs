//! In-memory host primitives
//!
//! Used by native workers and tests. Both stores can charge their bytes to a
//! shared [`ManualQuota`] so that quota admission sees real usage, and both
//! carry fault injection hooks for integrity and availability tests.

use super::{
    pending_keys, pending_value, DurableBlobStore, DurableDatabase, DurableTransaction,
    EphemeralBlobStore, EphemeralBucket, Headers, PendingOp, StoredBlob, TransactionMode,
};
use crate::quota::{QuotaEstimate, QuotaEstimator};
use crate::{GovernorError, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settable quota estimator
#[derive(Debug, Default)]
pub struct ManualQuota {
    usage: AtomicU64,
    quota: AtomicU64,
    queries: AtomicU64,
    failing: AtomicBool,
}

impl ManualQuota {
    /// Start at `usage` of `quota` bytes
    pub fn new(usage: u64, quota: u64) -> Self {
        Self {
            usage: AtomicU64::new(usage),
            quota: AtomicU64::new(quota),
            queries: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Overwrite current usage
    pub fn set_usage(&self, usage: u64) {
        self.usage.store(usage, Ordering::SeqCst);
    }

    /// Current usage
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    /// Number of estimates served
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Make `estimate` fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Charge `bytes`, failing like the host would when over quota
    pub fn reserve(&self, bytes: u64) -> Result<()> {
        let quota = self.quota.load(Ordering::SeqCst);
        self.usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|next| *next <= quota)
            })
            .map(|_| ())
            .map_err(|used| GovernorError::QuotaExceeded {
                requested: bytes,
                used,
                total: quota,
            })
    }

    /// Return `bytes` to the pool
    pub fn free(&self, bytes: u64) {
        let _ = self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    fn adjust(&self, old: u64, new: u64) -> Result<()> {
        if new > old {
            self.reserve(new - old)
        } else {
            self.free(old - new);
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl QuotaEstimator for ManualQuota {
    async fn estimate(&self) -> Result<QuotaEstimate> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(GovernorError::StorageUnavailable(
                "quota estimate unavailable".into(),
            ));
        }
        Ok(QuotaEstimate {
            usage_bytes: self.usage.load(Ordering::SeqCst),
            quota_bytes: self.quota.load(Ordering::SeqCst),
        })
    }
}

fn flip_first_byte(data: &Bytes) -> Bytes {
    let mut corrupted = data.to_vec();
    if let Some(first) = corrupted.first_mut() {
        *first ^= 0xff;
    } else {
        corrupted.push(0xff);
    }
    Bytes::from(corrupted)
}

/// In-memory cache buckets
#[derive(Debug, Default)]
pub struct MemoryEphemeralStore {
    buckets: Mutex<HashMap<String, Arc<MemoryBucket>>>,
    quota: Option<Arc<ManualQuota>>,
    unavailable: bool,
}

impl MemoryEphemeralStore {
    /// Store that does not charge any quota
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose bytes count against `quota`
    pub fn with_quota(quota: Arc<ManualQuota>) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Store that behaves like a host without the primitive
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Flip a byte of a stored blob in place
    pub fn corrupt(&self, bucket: &str, key: &str) -> bool {
        let buckets = lock(&self.buckets);
        let Some(bucket) = buckets.get(bucket) else {
            return false;
        };
        let mut entries = lock(&bucket.entries);
        match entries.get_mut(key) {
            Some(blob) => {
                blob.data = flip_first_byte(&blob.data);
                true
            }
            None => false,
        }
    }

    /// Number of blobs in a bucket
    pub fn blob_count(&self, bucket: &str) -> usize {
        lock(&self.buckets)
            .get(bucket)
            .map(|b| lock(&b.entries).len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl EphemeralBlobStore for MemoryEphemeralStore {
    async fn open(&self, name: &str) -> Result<Arc<dyn EphemeralBucket>> {
        if self.unavailable {
            return Err(GovernorError::StorageUnavailable(
                "ephemeral cache storage is not available".into(),
            ));
        }
        let mut buckets = lock(&self.buckets);
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryBucket {
                    entries: Mutex::new(HashMap::new()),
                    quota: self.quota.clone(),
                })
            })
            .clone();
        Ok(bucket)
    }

    async fn delete_all(&self, name: &str) -> Result<bool> {
        let removed = lock(&self.buckets).remove(name);
        match removed {
            Some(bucket) => {
                let freed: u64 = lock(&bucket.entries)
                    .drain()
                    .map(|(_, blob)| blob.data.len() as u64)
                    .sum();
                if let Some(quota) = &bucket.quota {
                    quota.free(freed);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug)]
struct MemoryBucket {
    entries: Mutex<HashMap<String, StoredBlob>>,
    quota: Option<Arc<ManualQuota>>,
}

#[async_trait::async_trait]
impl EphemeralBucket for MemoryBucket {
    async fn put(&self, key: &str, blob: Bytes, headers: Headers) -> Result<()> {
        let mut entries = lock(&self.entries);
        if let Some(quota) = &self.quota {
            let old = entries.get(key).map(|b| b.data.len() as u64).unwrap_or(0);
            quota.adjust(old, blob.len() as u64)?;
        }
        entries.insert(key.to_string(), StoredBlob { data: blob, headers });
        Ok(())
    }

    async fn match_key(&self, key: &str) -> Result<Option<StoredBlob>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match lock(&self.entries).remove(key) {
            Some(blob) => {
                if let Some(quota) = &self.quota {
                    quota.free(blob.data.len() as u64);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// In-memory transactional database host
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    databases: Mutex<HashMap<String, Arc<DatabaseState>>>,
    quota: Option<Arc<ManualQuota>>,
    unavailable: bool,
    commit_delay: Option<Duration>,
}

impl MemoryDurableStore {
    /// Host that does not charge any quota
    pub fn new() -> Self {
        Self::default()
    }

    /// Host whose committed bytes count against `quota`
    pub fn with_quota(quota: Arc<ManualQuota>) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Host without the primitive
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Make every commit take `delay`
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    fn database(&self, name: &str) -> Option<Arc<DatabaseState>> {
        lock(&self.databases).get(name).cloned()
    }

    /// Serve the next `times` reads of a key with a flipped byte
    pub fn corrupt_next_reads(&self, database: &str, store: &str, key: &str, times: u32) -> bool {
        match self.database(database) {
            Some(db) => {
                lock(&db.corrupt_reads).insert((store.to_string(), key.to_string()), times);
                true
            }
            None => false,
        }
    }

    /// Flip a byte of a stored value permanently
    pub fn corrupt_stored(&self, database: &str, store: &str, key: &str) -> bool {
        let Some(db) = self.database(database) else {
            return false;
        };
        let mut data = lock(&db.data);
        match data.get_mut(store).and_then(|s| s.get_mut(key)) {
            Some(value) => {
                *value = flip_first_byte(value);
                true
            }
            None => false,
        }
    }

    /// Remove a stored value behind the transaction layer
    pub fn remove_stored(&self, database: &str, store: &str, key: &str) -> bool {
        let Some(db) = self.database(database) else {
            return false;
        };
        let mut data = lock(&db.data);
        data.get_mut(store).and_then(|s| s.remove(key)).is_some()
    }

    /// Overwrite a stored value behind the transaction layer
    pub fn put_stored(&self, database: &str, store: &str, key: &str, value: Bytes) -> bool {
        let Some(db) = self.database(database) else {
            return false;
        };
        let mut data = lock(&db.data);
        match data.get_mut(store) {
            Some(entries) => {
                entries.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Keys currently stored in an object store
    pub fn stored_keys(&self, database: &str, store: &str) -> Vec<String> {
        let Some(db) = self.database(database) else {
            return Vec::new();
        };
        let data = lock(&db.data);
        data.get(store)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed transactions across all databases
    pub fn commit_count(&self) -> u64 {
        lock(&self.databases)
            .values()
            .map(|db| db.commits.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait::async_trait]
impl DurableBlobStore for MemoryDurableStore {
    async fn open(
        &self,
        name: &str,
        version: u32,
        stores: &[String],
    ) -> Result<Arc<dyn DurableDatabase>> {
        if self.unavailable {
            return Err(GovernorError::StorageUnavailable(
                "durable storage is not available".into(),
            ));
        }

        let db = lock(&self.databases)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(DatabaseState {
                    version: AtomicU64::new(0),
                    data: Mutex::new(HashMap::new()),
                    corrupt_reads: Mutex::new(HashMap::new()),
                    commits: AtomicU64::new(0),
                    quota: self.quota.clone(),
                    commit_delay: self.commit_delay,
                })
            })
            .clone();

        let current = db.version.load(Ordering::SeqCst);
        if current > u64::from(version) {
            return Err(GovernorError::StorageUnavailable(format!(
                "database {name} is at version {current}, cannot open at {version}"
            )));
        }
        db.version.store(u64::from(version), Ordering::SeqCst);
        {
            let mut data = lock(&db.data);
            for store in stores {
                data.entry(store.clone()).or_default();
            }
        }
        Ok(Arc::new(MemoryDatabase { state: db }))
    }
}

#[derive(Debug)]
struct DatabaseState {
    version: AtomicU64,
    data: Mutex<HashMap<String, BTreeMap<String, Bytes>>>,
    corrupt_reads: Mutex<HashMap<(String, String), u32>>,
    commits: AtomicU64,
    quota: Option<Arc<ManualQuota>>,
    commit_delay: Option<Duration>,
}

impl DatabaseState {
    fn read(&self, store: &str, key: &str) -> Option<Bytes> {
        let value = lock(&self.data).get(store)?.get(key).cloned()?;

        let mut corrupt = lock(&self.corrupt_reads);
        let slot = (store.to_string(), key.to_string());
        match corrupt.get_mut(&slot) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                if *remaining == 0 {
                    corrupt.remove(&slot);
                }
                Some(flip_first_byte(&value))
            }
            _ => Some(value),
        }
    }

    fn apply(&self, ops: Vec<PendingOp>) -> Result<()> {
        let mut data = lock(&self.data);

        // Charge the net size change first so a quota failure writes nothing
        if let Some(quota) = &self.quota {
            let (before, after) = projected_sizes(&data, &ops);
            quota.adjust(before, after)?;
        }

        for op in ops {
            match op {
                PendingOp::Put { store, key, value } => {
                    data.entry(store).or_default().insert(key, value);
                }
                PendingOp::Delete { store, key } => {
                    if let Some(s) = data.get_mut(&store) {
                        s.remove(&key);
                    }
                }
                PendingOp::Clear { store } => {
                    if let Some(s) = data.get_mut(&store) {
                        s.clear();
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Bytes held by the touched stores before and after `ops`
fn projected_sizes(data: &HashMap<String, BTreeMap<String, Bytes>>, ops: &[PendingOp]) -> (u64, u64) {
    let mut sizes: HashMap<&str, BTreeMap<&str, u64>> = HashMap::new();
    for op in ops {
        let store = match op {
            PendingOp::Put { store, .. }
            | PendingOp::Delete { store, .. }
            | PendingOp::Clear { store } => store.as_str(),
        };
        sizes.entry(store).or_insert_with(|| {
            data.get(store)
                .map(|s| s.iter().map(|(k, v)| (k.as_str(), v.len() as u64)).collect())
                .unwrap_or_default()
        });
    }
    let before: u64 = sizes.values().flat_map(|s| s.values()).sum();

    for op in ops {
        match op {
            PendingOp::Put { store, key, value } => {
                if let Some(s) = sizes.get_mut(store.as_str()) {
                    s.insert(key.as_str(), value.len() as u64);
                }
            }
            PendingOp::Delete { store, key } => {
                if let Some(s) = sizes.get_mut(store.as_str()) {
                    s.remove(key.as_str());
                }
            }
            PendingOp::Clear { store } => {
                if let Some(s) = sizes.get_mut(store.as_str()) {
                    s.clear();
                }
            }
        }
    }
    let after: u64 = sizes.values().flat_map(|s| s.values()).sum();
    (before, after)
}

#[derive(Debug)]
struct MemoryDatabase {
    state: Arc<DatabaseState>,
}

#[async_trait::async_trait]
impl DurableDatabase for MemoryDatabase {
    async fn transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
    ) -> Result<Box<dyn DurableTransaction>> {
        {
            let data = lock(&self.state.data);
            if let Some(missing) = stores.iter().find(|s| !data.contains_key(**s)) {
                return Err(GovernorError::Backend(format!(
                    "object store {missing} does not exist"
                )));
            }
        }

        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            scope: stores.iter().map(|s| s.to_string()).collect(),
            mode,
            ops: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<DatabaseState>,
    scope: Vec<String>,
    mode: TransactionMode,
    ops: Vec<PendingOp>,
}

impl MemoryTransaction {
    fn check_scope(&self, store: &str) -> Result<()> {
        if self.scope.iter().any(|s| s == store) {
            Ok(())
        } else {
            Err(GovernorError::Backend(format!(
                "object store {store} is not in the transaction scope"
            )))
        }
    }

    fn check_writable(&self, store: &str) -> Result<()> {
        self.check_scope(store)?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(GovernorError::Backend(
                "write attempted in a read-only transaction".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableTransaction for MemoryTransaction {
    async fn get(&mut self, store: &str, key: &str) -> Result<Option<Bytes>> {
        self.check_scope(store)?;
        if let Some(pending) = pending_value(&self.ops, store, key) {
            return Ok(pending);
        }
        Ok(self.state.read(store, key))
    }

    async fn put(&mut self, store: &str, key: &str, value: Bytes) -> Result<()> {
        self.check_writable(store)?;
        self.ops.push(PendingOp::Put {
            store: store.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&mut self, store: &str, key: &str) -> Result<()> {
        self.check_writable(store)?;
        self.ops.push(PendingOp::Delete {
            store: store.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn clear(&mut self, store: &str) -> Result<()> {
        self.check_writable(store)?;
        self.ops.push(PendingOp::Clear {
            store: store.to_string(),
        });
        Ok(())
    }

    async fn keys(&mut self, store: &str) -> Result<Vec<String>> {
        self.check_scope(store)?;
        let base: Vec<String> = {
            let data = lock(&self.state.data);
            data.get(store)
                .map(|s| s.keys().cloned().collect())
                .unwrap_or_default()
        };
        Ok(pending_keys(&self.ops, store, base))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if let Some(delay) = self.state.commit_delay {
            tokio::time::sleep(delay).await;
        }
        if self.ops.is_empty() {
            return Ok(());
        }
        let MemoryTransaction { state, ops, .. } = *self;
        state.apply(ops)
    }
}
