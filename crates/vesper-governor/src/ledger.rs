//! In-memory allocation ledger
//!
//! Tracks every live numeric buffer in one execution context and keeps the
//! tracked total under a fixed byte budget.
//!
//! # Accounting
//!
//! ```text
//! total_bytes_used == Σ byte_size of live allocations
//!
//!   track ──► [reject if size+aux > max]
//!         ──► [evict lowest (priority, last access) until it fits]
//!         ──► [admit or reject]
//!
//!   release / evict ──► remove from map + subtract + dispose   (one step)
//! ```
//!
//! All operations are synchronous. Callers that share a ledger across tasks
//! go through [`SharedLedger`], whose lock is never held across an await.

use crate::config::LedgerConfig;
use crate::tensor::NumericBuffer;
use crate::{GovernorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info};

/// Identifier of a tracked allocation; never reused within a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(u64);

impl AllocationId {
    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Rebuild from a raw value received over the wire
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}

/// Ledger record for one buffer
#[derive(Debug, Clone)]
pub struct TrackedAllocation {
    pub id: AllocationId,
    pub byte_size: u64,
    pub aux_bytes: u64,
    pub priority: i32,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub disposed: bool,
    pub label: Option<String>,
    /// Logical access clock, breaks ties between equal timestamps
    access_seq: u64,
}

impl TrackedAllocation {
    fn eviction_key(&self) -> (i32, Instant, u64) {
        (self.priority, self.last_accessed_at, self.access_seq)
    }
}

/// Point-in-time ledger totals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_bytes_used: u64,
    pub aux_bytes_used: u64,
    pub count: usize,
    pub pinned_count: usize,
    pub max_bytes: u64,
    pub utilization_percentage: f64,
}

/// Budgeted allocation tracker
pub struct ResourceLedger {
    config: LedgerConfig,
    allocations: HashMap<AllocationId, TrackedAllocation>,
    handles: HashMap<AllocationId, Box<dyn NumericBuffer>>,
    total_bytes: u64,
    aux_bytes: u64,
    next_id: u64,
    access_clock: u64,
    evictions: u64,
}

impl fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLedger")
            .field("config", &self.config)
            .field("count", &self.allocations.len())
            .field("total_bytes", &self.total_bytes)
            .field("aux_bytes", &self.aux_bytes)
            .finish()
    }
}

impl ResourceLedger {
    /// Create an empty ledger
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            allocations: HashMap::new(),
            handles: HashMap::new(),
            total_bytes: 0,
            aux_bytes: 0,
            next_id: 1,
            access_clock: 0,
            evictions: 0,
        }
    }

    /// Track a buffer by size only
    ///
    /// Room is made by evicting against the current totals before the new
    /// request is counted.
    pub fn track(&mut self, size_bytes: u64, aux_bytes: u64, priority: i32) -> Result<AllocationId> {
        self.admit(size_bytes, aux_bytes)?;
        Ok(self.insert(size_bytes, aux_bytes, priority, None))
    }

    /// Track a labelled buffer by size only
    pub fn track_labeled(
        &mut self,
        size_bytes: u64,
        aux_bytes: u64,
        priority: i32,
        label: impl Into<String>,
    ) -> Result<AllocationId> {
        self.admit(size_bytes, aux_bytes)?;
        Ok(self.insert(size_bytes, aux_bytes, priority, Some(label.into())))
    }

    /// Take ownership of a buffer; it is disposed on release or eviction
    ///
    /// A rejected buffer is disposed immediately so that nothing ungoverned
    /// stays alive.
    pub fn track_buffer(
        &mut self,
        mut buffer: Box<dyn NumericBuffer>,
        priority: i32,
        label: Option<String>,
    ) -> Result<AllocationId> {
        let (size, aux) = {
            let meta = buffer.meta();
            (meta.byte_size, meta.aux_bytes)
        };
        if let Err(e) = self.admit(size, aux) {
            buffer.dispose();
            return Err(e);
        }
        let id = self.insert(size, aux, priority, label);
        self.handles.insert(id, buffer);
        Ok(id)
    }

    fn admit(&mut self, size_bytes: u64, aux_bytes: u64) -> Result<()> {
        let max = self.config.max_bytes;
        let request = size_bytes.saturating_add(aux_bytes);

        if request > max {
            return Err(GovernorError::AllocationRejected {
                requested: request,
                available: self.available(),
                max,
            });
        }

        if self.total_bytes + size_bytes > max {
            let limit = max - size_bytes;
            let evicted = self.evict_down_to(limit).len();
            debug!(
                "Made room for {} bytes: evicted {} allocations, {} bytes used",
                size_bytes, evicted, self.total_bytes
            );
        }

        if self.total_bytes + size_bytes > max {
            return Err(GovernorError::AllocationRejected {
                requested: size_bytes,
                available: self.available(),
                max,
            });
        }

        Ok(())
    }

    fn insert(
        &mut self,
        size_bytes: u64,
        aux_bytes: u64,
        priority: i32,
        label: Option<String>,
    ) -> AllocationId {
        let id = AllocationId(self.next_id);
        self.next_id += 1;
        self.access_clock += 1;

        let now = Instant::now();
        self.allocations.insert(
            id,
            TrackedAllocation {
                id,
                byte_size: size_bytes,
                aux_bytes,
                priority,
                created_at: now,
                last_accessed_at: now,
                disposed: false,
                label,
                access_seq: self.access_clock,
            },
        );
        self.total_bytes += size_bytes;
        self.aux_bytes += aux_bytes;

        debug!(
            "Tracked {} ({} bytes, aux {}, priority {}), {} bytes used",
            id, size_bytes, aux_bytes, priority, self.total_bytes
        );
        id
    }

    /// Mark an allocation as recently used
    pub fn touch(&mut self, id: AllocationId) -> bool {
        match self.allocations.get_mut(&id) {
            Some(alloc) => {
                self.access_clock += 1;
                alloc.last_accessed_at = Instant::now();
                alloc.access_seq = self.access_clock;
                true
            }
            None => false,
        }
    }

    /// Release an allocation; `false` if unknown or already released
    pub fn release(&mut self, id: AllocationId) -> bool {
        match self.remove(id) {
            Some(alloc) => {
                debug!(
                    "Released {} ({} bytes), {} bytes used",
                    alloc.id, alloc.byte_size, self.total_bytes
                );
                true
            }
            None => false,
        }
    }

    /// Evict until utilization is at most `target_utilization`
    ///
    /// Returns the number of allocations evicted. Stops early when only
    /// pinned allocations remain.
    pub fn evict_to_threshold(&mut self, target_utilization: f64) -> usize {
        self.drain_to_threshold(target_utilization).len()
    }

    /// Like [`evict_to_threshold`](Self::evict_to_threshold) but returns the
    /// evicted records
    pub fn drain_to_threshold(&mut self, target_utilization: f64) -> Vec<TrackedAllocation> {
        let target = target_utilization.clamp(0.0, 1.0);
        let limit = (self.config.max_bytes as f64 * target).floor() as u64;
        let evicted = self.evict_down_to(limit);
        if !evicted.is_empty() {
            info!(
                "Evicted {} allocations to reach {:.1}% ({} bytes used)",
                evicted.len(),
                target * 100.0,
                self.total_bytes
            );
        }
        evicted
    }

    /// Single bounded pass over a snapshot of unpinned candidates
    fn evict_down_to(&mut self, limit_bytes: u64) -> Vec<TrackedAllocation> {
        if self.total_bytes <= limit_bytes {
            return Vec::new();
        }

        let pin = self.config.pin_priority;
        let mut candidates: Vec<_> = self
            .allocations
            .values()
            .filter(|a| a.priority <= pin)
            .map(|a| (a.eviction_key(), a.id))
            .collect();
        candidates.sort_unstable();

        let mut evicted = Vec::new();
        for (_, id) in candidates {
            if self.total_bytes <= limit_bytes {
                break;
            }
            if let Some(alloc) = self.remove(id) {
                evicted.push(alloc);
            }
        }
        self.evictions += evicted.len() as u64;
        evicted
    }

    /// Remove, subtract and dispose in one step
    fn remove(&mut self, id: AllocationId) -> Option<TrackedAllocation> {
        let mut alloc = self.allocations.remove(&id)?;
        alloc.disposed = true;
        self.total_bytes -= alloc.byte_size;
        self.aux_bytes -= alloc.aux_bytes;
        if let Some(mut handle) = self.handles.remove(&id) {
            handle.dispose();
        }
        Some(alloc)
    }

    /// Current totals
    pub fn stats(&self) -> LedgerStats {
        let max = self.config.max_bytes;
        LedgerStats {
            total_bytes_used: self.total_bytes,
            aux_bytes_used: self.aux_bytes,
            count: self.allocations.len(),
            pinned_count: self
                .allocations
                .values()
                .filter(|a| a.priority > self.config.pin_priority)
                .count(),
            max_bytes: max,
            utilization_percentage: self.utilization() * 100.0,
        }
    }

    /// Utilization as a fraction of the budget; 0 for a zero budget
    pub fn utilization(&self) -> f64 {
        match self.config.max_bytes {
            0 => 0.0,
            max => self.total_bytes as f64 / max as f64,
        }
    }

    /// Bytes still admissible without eviction
    pub fn available(&self) -> u64 {
        self.config.max_bytes.saturating_sub(self.total_bytes)
    }

    /// Look up a live allocation
    pub fn get(&self, id: AllocationId) -> Option<&TrackedAllocation> {
        self.allocations.get(&id)
    }

    /// Check if an allocation is live
    pub fn contains(&self, id: AllocationId) -> bool {
        self.allocations.contains_key(&id)
    }

    /// Iterate live allocations in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &TrackedAllocation> {
        self.allocations.values()
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Check if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Allocations evicted since construction
    pub fn eviction_count(&self) -> u64 {
        self.evictions
    }

    /// Get configuration
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

/// Ledger shared between the tasks of one execution context
#[derive(Clone, Debug)]
pub struct SharedLedger {
    inner: Arc<Mutex<ResourceLedger>>,
}

impl SharedLedger {
    /// Wrap a ledger
    pub fn new(ledger: ResourceLedger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    /// Build from configuration
    pub fn from_config(config: LedgerConfig) -> Self {
        Self::new(ResourceLedger::new(config))
    }

    /// Lock the ledger; a poisoned lock is recovered since every ledger
    /// operation leaves the totals consistent before it can panic
    pub fn lock(&self) -> MutexGuard<'_, ResourceLedger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a scoped allocation
    pub fn lease(&self, size_bytes: u64, aux_bytes: u64, priority: i32) -> Result<Lease> {
        let id = self.lock().track(size_bytes, aux_bytes, priority)?;
        Ok(Lease {
            ledger: self.clone(),
            id,
            byte_size: size_bytes,
            released: false,
        })
    }

    /// Current totals
    pub fn stats(&self) -> LedgerStats {
        self.lock().stats()
    }
}

/// Allocation released when dropped
///
/// Holding a lease across an await is fine; the ledger lock is only taken
/// on acquire and release.
#[derive(Debug)]
pub struct Lease {
    ledger: SharedLedger,
    id: AllocationId,
    byte_size: u64,
    released: bool,
}

impl Lease {
    /// Ledger id of this lease
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Bytes held
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Release now; `false` if the allocation was already evicted
    pub fn release(mut self) -> bool {
        self.released = true;
        self.ledger.lock().release(self.id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.ledger.lock().release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, HostTensor};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ledger(max: u64) -> ResourceLedger {
        ResourceLedger::new(LedgerConfig::default().with_max_bytes(max))
    }

    #[test]
    fn test_track_and_release() {
        let mut ledger = ledger(1000);
        let a = ledger.track(300, 50, 1).unwrap();
        let b = ledger.track(200, 0, 1).unwrap();

        let stats = ledger.stats();
        assert_eq!(stats.total_bytes_used, 500);
        assert_eq!(stats.aux_bytes_used, 50);
        assert_eq!(stats.count, 2);
        assert!((stats.utilization_percentage - 50.0).abs() < f64::EPSILON);

        assert!(ledger.release(a));
        assert_eq!(ledger.stats().total_bytes_used, 200);
        assert_eq!(ledger.stats().aux_bytes_used, 0);
        assert!(ledger.contains(b));
    }

    #[test]
    fn test_zero_budget_reports_zero_utilization() {
        let mut ledger = ledger(0);
        assert!(ledger.track(1, 0, 1).is_err());
        ledger.track(0, 0, 1).unwrap();

        let stats = ledger.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.utilization_percentage, 0.0);
        assert_eq!(ledger.utilization(), 0.0);
        assert!(!ledger.utilization().is_nan());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ledger = ledger(1000);
        let a = ledger.track(100, 0, 1).unwrap();
        assert!(ledger.release(a));
        let before = ledger.stats();
        assert!(!ledger.release(a));
        assert_eq!(ledger.stats(), before);
        assert!(!ledger.release(AllocationId::from_u64(999)));
    }

    #[test]
    fn test_oversized_rejected_without_mutation() {
        let mut ledger = ledger(1000);
        ledger.track(600, 0, 1).unwrap();
        let before = ledger.stats();

        let err = ledger.track(900, 200, 1).unwrap_err();
        assert!(matches!(err, GovernorError::AllocationRejected { .. }));
        assert_eq!(ledger.stats(), before);
        assert_eq!(ledger.eviction_count(), 0);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut ledger = ledger(1000);
        let a = ledger.track(10, 0, 1).unwrap();
        ledger.release(a);
        let b = ledger.track(10, 0, 1).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_evicts_oldest_of_equal_priority() {
        let mut ledger = ledger(1000);
        let a = ledger.track(400, 0, 1).unwrap();
        let b = ledger.track(400, 0, 1).unwrap();
        let c = ledger.track(400, 0, 1).unwrap();

        assert!(!ledger.contains(a));
        assert!(ledger.contains(b));
        assert!(ledger.contains(c));
        assert_eq!(ledger.stats().total_bytes_used, 800);
    }

    #[test]
    fn test_touch_changes_victim() {
        let mut ledger = ledger(1000);
        let a = ledger.track(400, 0, 1).unwrap();
        let b = ledger.track(400, 0, 1).unwrap();
        assert!(ledger.touch(a));

        ledger.track(400, 0, 1).unwrap();
        assert!(ledger.contains(a));
        assert!(!ledger.contains(b));
    }

    #[test]
    fn test_lower_priority_evicted_first() {
        let mut ledger = ledger(1000);
        let old_high = ledger.track(300, 0, 5).unwrap();
        let new_low = ledger.track(300, 0, 0).unwrap();
        ledger.track(300, 0, 5).unwrap();

        assert_eq!(ledger.evict_to_threshold(0.6), 1);
        assert!(ledger.contains(old_high));
        assert!(!ledger.contains(new_low));
    }

    #[test]
    fn test_pinned_never_evicted() {
        let mut ledger = ResourceLedger::new(
            LedgerConfig::default()
                .with_max_bytes(1000)
                .with_pin_priority(10),
        );
        let pinned = ledger.track(700, 0, 11).unwrap();
        ledger.track(200, 0, 1).unwrap();

        assert_eq!(ledger.evict_to_threshold(0.0), 1);
        assert!(ledger.contains(pinned));
        assert_eq!(ledger.stats().pinned_count, 1);

        // Pinned bytes leave no room for this one
        let err = ledger.track(400, 0, 1).unwrap_err();
        assert!(matches!(err, GovernorError::AllocationRejected { .. }));
        assert_eq!(ledger.stats().total_bytes_used, 700);
    }

    #[test]
    fn test_evict_to_threshold_reaches_target() {
        let mut ledger = ledger(1000);
        for _ in 0..9 {
            ledger.track(100, 0, 1).unwrap();
        }
        let evicted = ledger.evict_to_threshold(0.5);
        assert_eq!(evicted, 4);
        assert!(ledger.utilization() <= 0.5);

        assert_eq!(ledger.evict_to_threshold(0.9), 0);
    }

    #[test]
    fn test_drain_returns_disposed_records() {
        let mut ledger = ledger(1000);
        ledger.track_labeled(500, 0, 1, "latent").unwrap();
        let drained = ledger.drain_to_threshold(0.0);
        assert_eq!(drained.len(), 1);
        assert!(drained[0].disposed);
        assert_eq!(drained[0].label.as_deref(), Some("latent"));
        assert!(ledger.is_empty());
    }

    struct Flagged {
        meta: crate::tensor::TensorMeta,
        disposed: Arc<AtomicBool>,
    }

    impl NumericBuffer for Flagged {
        fn meta(&self) -> &crate::tensor::TensorMeta {
            &self.meta
        }

        fn dispose(&mut self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_buffer_disposed_on_eviction() {
        let mut ledger = ledger(1000);
        let flag = Arc::new(AtomicBool::new(false));
        let buffer = Flagged {
            meta: crate::tensor::TensorMeta::dense(vec![600], DType::U8),
            disposed: flag.clone(),
        };
        ledger.track_buffer(Box::new(buffer), 0, None).unwrap();
        assert!(!flag.load(Ordering::SeqCst));

        ledger.track(600, 0, 1).unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_rejected_buffer_is_disposed() {
        let mut ledger = ledger(100);
        let flag = Arc::new(AtomicBool::new(false));
        let buffer = Flagged {
            meta: crate::tensor::TensorMeta::dense(vec![200], DType::U8),
            disposed: flag.clone(),
        };
        assert!(ledger.track_buffer(Box::new(buffer), 0, None).is_err());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_host_tensor_tracking() {
        let mut ledger = ledger(1 << 20);
        let tensor = HostTensor::zeros(vec![16, 16], DType::F32).with_aux_bytes(128);
        let id = ledger
            .track_buffer(Box::new(tensor), 1, Some("frame".into()))
            .unwrap();
        assert_eq!(ledger.get(id).unwrap().byte_size, 1024);
        assert_eq!(ledger.stats().aux_bytes_used, 128);
        assert!(ledger.release(id));
        assert_eq!(ledger.stats().aux_bytes_used, 0);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let shared = SharedLedger::from_config(LedgerConfig::default().with_max_bytes(1000));
        {
            let lease = shared.lease(400, 0, 1).unwrap();
            assert_eq!(lease.byte_size(), 400);
            assert_eq!(shared.stats().total_bytes_used, 400);
        }
        assert_eq!(shared.stats().total_bytes_used, 0);

        let lease = shared.lease(400, 0, 1).unwrap();
        assert!(lease.release());
        assert_eq!(shared.stats().count, 0);
    }

    #[test]
    fn test_lease_release_after_eviction() {
        let shared = SharedLedger::from_config(LedgerConfig::default().with_max_bytes(1000));
        let lease = shared.lease(400, 0, 1).unwrap();
        shared.lock().evict_to_threshold(0.0);
        assert!(!lease.release());
        assert_eq!(shared.stats().total_bytes_used, 0);
    }
}
