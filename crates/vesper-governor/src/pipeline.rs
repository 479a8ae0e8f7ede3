//! Batch pipeline orchestration
//!
//! Runs a sequence of work units through a [`BatchProcessor`] in batches
//! sized from the ledger headroom. Every unit holds a [`Lease`] for the
//! duration of its batch, so the ledger never loses track of in-flight
//! memory and every lease is returned whether the batch succeeds or fails.
//!
//! ```text
//! Idle ──► Loading ──► Processing ──┬──► Completed
//!                        ▲    │     ├──► Cancelled    (flag at batch boundary)
//!                        └────┘     ├──► Interrupted  (pressure event)
//!                     next batch    └──► Error
//! ```

use crate::cache::EphemeralCache;
use crate::config::PipelineConfig;
use crate::ledger::{Lease, SharedLedger};
use crate::pressure::{PressureSignal, Subscription};
use crate::store::PersistentStore;
use crate::{GovernorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Loading,
    Processing,
    Completed,
    Cancelled,
    Interrupted,
    Error,
}

impl PipelineState {
    /// Whether a run has ended in this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed
                | PipelineState::Cancelled
                | PipelineState::Interrupted
                | PipelineState::Error
        )
    }
}

/// Outcome of an emergency pressure pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureReport {
    pub allocations_evicted: usize,
    pub cache_entries_cleared: usize,
    pub locks_released: usize,
    /// Failures that were logged instead of raised
    pub errors: Vec<String>,
}

/// Progress notification
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    StateChanged(PipelineState),
    BatchStarted { index: usize, size: usize },
    BatchCompleted { index: usize, size: usize },
    CleanupRan { evicted: usize, cache_removed: usize },
    PressureHandled(PressureReport),
}

/// Combined view of the ledger, cache and pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorStatus {
    pub total_bytes_used: u64,
    pub aux_bytes_used: u64,
    pub num_tracked: usize,
    pub utilization_percentage: f64,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub pipeline_state: PipelineState,
}

/// Summary of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: PipelineState,
    pub units_processed: usize,
    pub batches: usize,
    pub cleanups: usize,
    /// Highest ledger utilization observed with a batch admitted
    pub peak_utilization: f64,
    pub pressure: Option<PressureReport>,
}

/// Cooperative cancellation, honored between batches
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Model-side work performed on each admitted batch
#[async_trait::async_trait]
pub trait BatchProcessor<U: Sync>: Send + Sync {
    /// Prepare before the first batch
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    /// Process one batch of units
    async fn process_batch(&self, batch: &[U]) -> Result<()>;
}

/// Drives batches through the ledger, cache and store of one context
pub struct PipelineOrchestrator {
    ledger: SharedLedger,
    cache: Arc<EphemeralCache>,
    store: Arc<PersistentStore>,
    config: PipelineConfig,
    state_tx: watch::Sender<PipelineState>,
    events: broadcast::Sender<StatusEvent>,
    cancel: CancellationFlag,
    pressure_pending: Arc<AtomicBool>,
    pressure_notify: Arc<Notify>,
    interrupted: AtomicBool,
    run_lock: tokio::sync::Mutex<()>,
    attachment: Mutex<Option<PressureAttachment>>,
}

/// Subscription plus the task that answers it while no run is active
struct PressureAttachment {
    _subscription: Subscription,
    driver: JoinHandle<()>,
}

impl Drop for PressureAttachment {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    pub fn new(
        ledger: SharedLedger,
        cache: Arc<EphemeralCache>,
        store: Arc<PersistentStore>,
        config: PipelineConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ledger,
            cache,
            store,
            config,
            state_tx,
            events,
            cancel: CancellationFlag::new(),
            pressure_pending: Arc::new(AtomicBool::new(false)),
            pressure_notify: Arc::new(Notify::new()),
            interrupted: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
            attachment: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Flag checked at every batch boundary
    pub fn cancellation_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn set_state(&self, state: PipelineState) {
        self.state_tx.send_replace(state);
        self.emit(StatusEvent::StateChanged(state));
    }

    fn emit(&self, event: StatusEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn attachment(&self) -> MutexGuard<'_, Option<PressureAttachment>> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route pressure events from `signal` to this orchestrator
    ///
    /// While idle, an event runs [`handle_pressure`](Self::handle_pressure)
    /// right away on a background task; during a run it is handled at the
    /// next batch boundary. Replaces any earlier subscription. Must be
    /// called inside a tokio runtime.
    pub fn attach_pressure(self: &Arc<Self>, signal: &dyn PressureSignal) {
        let pending = self.pressure_pending.clone();
        let notify = self.pressure_notify.clone();
        let subscription = signal.subscribe(Arc::new(move || {
            pending.store(true, Ordering::SeqCst);
            notify.notify_one();
        }));
        let driver = tokio::spawn(drive_pressure(
            Arc::downgrade(self),
            self.pressure_notify.clone(),
        ));
        *self.attachment() = Some(PressureAttachment {
            _subscription: subscription,
            driver,
        });
    }

    pub fn detach_pressure(&self) {
        self.attachment().take();
    }

    /// Whether a pressure event is waiting to be handled
    pub fn pressure_pending(&self) -> bool {
        self.pressure_pending.load(Ordering::SeqCst)
    }

    /// Handle a pending event once no run is in flight
    ///
    /// A run that sees the flag first handles it at its next batch boundary
    /// and this returns `None`.
    async fn handle_idle_pressure(&self) -> Option<PressureReport> {
        let _idle = self.run_lock.lock().await;
        if !self.pressure_pending.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.handle_pressure().await)
    }

    /// Units that fit in the current ledger headroom
    pub fn compute_batch_size(&self) -> usize {
        let headroom = self.ledger.lock().available();
        let cost = self.config.per_unit_cost.max(1);
        let fit = (headroom as f64 * self.config.safety_factor / cost as f64).floor() as usize;
        fit.clamp(1, self.config.max_batch.max(1))
    }

    /// Evict ahead of a batch whose projected usage crosses the threshold
    async fn proactive_cleanup(&self, batch_size: usize) -> Option<(usize, usize)> {
        let evicted = {
            let mut ledger = self.ledger.lock();
            let max = ledger.config().max_bytes as f64;
            let projected = ledger.stats().total_bytes_used
                + batch_size as u64 * self.config.per_unit_cost;
            if (projected as f64) <= self.config.cleanup_threshold * max {
                return None;
            }
            ledger.evict_to_threshold(self.config.cleanup_threshold)
        };

        let cache_removed = match self.cache.cleanup().await {
            Ok(report) => report.expired + report.evicted,
            Err(e) => {
                warn!("Cache cleanup before batch failed: {}", e);
                0
            }
        };
        debug!(
            "Proactive cleanup: {} allocations, {} cache entries",
            evicted, cache_removed
        );
        self.emit(StatusEvent::CleanupRan {
            evicted,
            cache_removed,
        });
        Some((evicted, cache_removed))
    }

    /// Lease up to `size` units; fewer when memory runs out
    fn admit_batch(&self, size: usize) -> Result<Vec<Lease>> {
        let cost = self.config.per_unit_cost;
        let mut leases = Vec::with_capacity(size);
        for _ in 0..size {
            if !leases.is_empty() && self.ledger.lock().available() < cost {
                break;
            }
            match self
                .ledger
                .lease(cost, self.config.aux_per_unit, self.config.unit_priority)
            {
                Ok(lease) => leases.push(lease),
                Err(e) if leases.is_empty() => return Err(e),
                Err(_) => break,
            }
        }
        if leases.len() < size {
            debug!("Batch shrunk from {} to {} units", size, leases.len());
        }
        Ok(leases)
    }

    /// Release what can be released after a pressure event
    ///
    /// Runs regardless of current utilization. Failures are logged and
    /// recorded in the report, never returned. The current run, if any, ends
    /// as `Interrupted` at its next batch boundary and is not resumed.
    pub async fn handle_pressure(&self) -> PressureReport {
        self.pressure_pending.store(false, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);

        let mut report = PressureReport {
            allocations_evicted: self
                .ledger
                .lock()
                .evict_to_threshold(self.config.emergency_target),
            ..PressureReport::default()
        };
        match self.cache.clear().await {
            Ok(cleared) => report.cache_entries_cleared = cleared,
            Err(e) => {
                error!("Emergency cache clear failed: {}", e);
                report.errors.push(e.to_string());
            }
        }
        report.locks_released = self.store.release_idle_locks();

        warn!(
            "Pressure pass: {} allocations evicted, {} cache entries cleared, {} locks released",
            report.allocations_evicted, report.cache_entries_cleared, report.locks_released
        );
        self.emit(StatusEvent::PressureHandled(report.clone()));
        report
    }

    /// Process every unit, batch by batch
    ///
    /// Cancellation returns [`GovernorError::Cancelled`]; a pressure event
    /// ends the run with an `Interrupted` report.
    pub async fn run<U, P>(&self, units: &[U], processor: &P) -> Result<RunReport>
    where
        U: Sync,
        P: BatchProcessor<U> + ?Sized,
    {
        let _run = self.run_lock.lock().await;
        // An event that raced the previous run's end is handled, not held
        // against this run
        let stale = if self.pressure_pending.load(Ordering::SeqCst) {
            Some(self.handle_pressure().await)
        } else {
            None
        };
        self.cancel.reset();
        self.interrupted.store(false, Ordering::SeqCst);

        let mut report = RunReport {
            outcome: PipelineState::Loading,
            units_processed: 0,
            batches: 0,
            cleanups: 0,
            peak_utilization: self.ledger.lock().utilization(),
            pressure: stale,
        };

        self.set_state(PipelineState::Loading);
        if let Err(e) = processor.load().await {
            error!("Pipeline load failed: {}", e);
            self.set_state(PipelineState::Error);
            return Err(e);
        }
        self.set_state(PipelineState::Processing);
        info!("Pipeline started with {} units", units.len());

        while report.units_processed < units.len() {
            if self.pressure_pending.load(Ordering::SeqCst) {
                report.pressure = Some(self.handle_pressure().await);
            }
            if self.interrupted.swap(false, Ordering::SeqCst) {
                info!(
                    "Pipeline interrupted after {} units",
                    report.units_processed
                );
                report.outcome = PipelineState::Interrupted;
                self.set_state(PipelineState::Interrupted);
                return Ok(report);
            }
            if self.cancel.is_cancelled() {
                info!("Pipeline cancelled after {} units", report.units_processed);
                self.set_state(PipelineState::Cancelled);
                return Err(GovernorError::Cancelled);
            }

            let remaining = units.len() - report.units_processed;
            let wanted = self.compute_batch_size().min(remaining);
            if self.proactive_cleanup(wanted).await.is_some() {
                report.cleanups += 1;
            }

            let leases = match self.admit_batch(wanted) {
                Ok(leases) => leases,
                Err(e) => {
                    error!("Insufficient memory for batch {}: {}", report.batches, e);
                    self.set_state(PipelineState::Error);
                    return Err(e);
                }
            };
            let size = leases.len();
            let index = report.batches;
            report.peak_utilization = report
                .peak_utilization
                .max(self.ledger.lock().utilization());

            let start = report.units_processed;
            self.emit(StatusEvent::BatchStarted { index, size });
            let result = processor.process_batch(&units[start..start + size]).await;
            drop(leases);

            if let Err(e) = result {
                error!("Batch {} failed: {}", index, e);
                self.set_state(PipelineState::Error);
                return Err(e);
            }
            report.units_processed += size;
            report.batches += 1;
            self.emit(StatusEvent::BatchCompleted { index, size });
            // Re-entrant per batch
            self.set_state(PipelineState::Processing);
        }

        if self.pressure_pending.load(Ordering::SeqCst) {
            // Raised during the last batch
            report.pressure = Some(self.handle_pressure().await);
        }
        info!(
            "Pipeline completed: {} units in {} batches",
            report.units_processed, report.batches
        );
        report.outcome = PipelineState::Completed;
        self.set_state(PipelineState::Completed);
        Ok(report)
    }

    /// Combined resource status
    pub fn status(&self) -> GovernorStatus {
        let ledger = self.ledger.stats();
        GovernorStatus {
            total_bytes_used: ledger.total_bytes_used,
            aux_bytes_used: ledger.aux_bytes_used,
            num_tracked: ledger.count,
            utilization_percentage: ledger.utilization_percentage,
            cache_entries: self.cache.len(),
            cache_bytes: self.cache.total_bytes(),
            pipeline_state: self.state(),
        }
    }
}

/// Answer pressure events while the orchestrator is idle
async fn drive_pressure(pipeline: Weak<PipelineOrchestrator>, notify: Arc<Notify>) {
    loop {
        notify.notified().await;
        let Some(pipeline) = pipeline.upgrade() else {
            break;
        };
        pipeline.handle_idle_pressure().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ManualQuota, MemoryDurableStore, MemoryEphemeralStore};
    use crate::cache::{CachedPayload, SetOptions};
    use crate::config::{CacheConfig, LedgerConfig, StoreConfig};
    use crate::pressure::ManualPressure;
    use crate::quota::QuotaOracle;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    async fn orchestrator(max_bytes: u64, config: PipelineConfig) -> PipelineOrchestrator {
        let quota = Arc::new(ManualQuota::new(0, 1 << 30));
        let oracle = QuotaOracle::new(quota);
        let cache = EphemeralCache::open(
            Arc::new(MemoryEphemeralStore::new()),
            oracle.clone(),
            CacheConfig::default(),
        )
        .await
        .unwrap();
        let store = PersistentStore::open(&MemoryDurableStore::new(), oracle, StoreConfig::default())
            .await
            .unwrap();
        PipelineOrchestrator::new(
            SharedLedger::from_config(LedgerConfig::default().with_max_bytes(max_bytes)),
            Arc::new(cache),
            Arc::new(store),
            config,
        )
    }

    /// Records batch sizes and the ledger load seen inside each batch
    struct Recorder {
        ledger: SharedLedger,
        sizes: Mutex<Vec<usize>>,
        peak: Mutex<f64>,
        fail_on: Option<usize>,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(ledger: &SharedLedger) -> Self {
            Self {
                ledger: ledger.clone(),
                sizes: Mutex::new(Vec::new()),
                peak: Mutex::new(0.0),
                fail_on: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl BatchProcessor<u32> for Recorder {
        async fn process_batch(&self, batch: &[u32]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(batch.len());
            let utilization = self.ledger.lock().utilization();
            let mut peak = self.peak.lock().unwrap();
            *peak = peak.max(utilization);
            if self.fail_on == Some(call) {
                return Err(GovernorError::Backend("model failed".into()));
            }
            Ok(())
        }
    }

    fn config(cost: u64, max_batch: usize) -> PipelineConfig {
        PipelineConfig::default()
            .with_per_unit_cost(cost)
            .with_max_batch(max_batch)
            .with_safety_factor(1.0)
    }

    #[tokio::test]
    async fn test_batch_size_from_headroom() {
        let pipeline = orchestrator(1000, config(100, 8)).await;
        assert_eq!(pipeline.compute_batch_size(), 8);

        pipeline.ledger().lock().track(500, 0, 0).unwrap();
        assert_eq!(pipeline.compute_batch_size(), 5);

        pipeline.ledger().lock().track(450, 0, 0).unwrap();
        assert_eq!(pipeline.compute_batch_size(), 1);
    }

    #[tokio::test]
    async fn test_run_completes_and_releases() {
        let pipeline = orchestrator(1000, config(100, 4)).await;
        let recorder = Recorder::new(pipeline.ledger());
        let units: Vec<u32> = (0..10).collect();

        let report = pipeline.run(&units, &recorder).await.unwrap();
        assert_eq!(report.outcome, PipelineState::Completed);
        assert_eq!(report.units_processed, 10);
        assert_eq!(*recorder.sizes.lock().unwrap(), vec![4, 4, 2]);
        assert_eq!(pipeline.ledger().stats().total_bytes_used, 0);
        assert_eq!(pipeline.state(), PipelineState::Completed);
    }

    #[tokio::test]
    async fn test_failed_batch_releases_leases() {
        let pipeline = orchestrator(1000, config(100, 4)).await;
        let mut recorder = Recorder::new(pipeline.ledger());
        recorder.fail_on = Some(1);
        let units: Vec<u32> = (0..10).collect();

        assert!(pipeline.run(&units, &recorder).await.is_err());
        assert_eq!(pipeline.state(), PipelineState::Error);
        assert_eq!(pipeline.ledger().stats().count, 0);
    }

    #[tokio::test]
    async fn test_pinned_memory_rejects_run() {
        let pipeline = orchestrator(1000, config(100, 4)).await;
        pipeline.ledger().lock().track(950, 0, 1000).unwrap();

        let recorder = Recorder::new(pipeline.ledger());
        let err = pipeline.run(&[1u32, 2, 3], &recorder).await.unwrap_err();
        assert!(matches!(err, GovernorError::AllocationRejected { .. }));
        assert_eq!(pipeline.state(), PipelineState::Error);
        assert_eq!(pipeline.ledger().stats().count, 1);
    }

    #[tokio::test]
    async fn test_proactive_cleanup_evicts_idle_allocations() {
        let pipeline = orchestrator(1000, config(100, 2).with_cleanup_threshold(0.5)).await;
        pipeline.ledger().lock().track(400, 0, 0).unwrap();
        pipeline.ledger().lock().track(200, 0, 0).unwrap();

        let recorder = Recorder::new(pipeline.ledger());
        let report = pipeline.run(&[1u32, 2], &recorder).await.unwrap();
        assert_eq!(report.cleanups, 1);
        assert!(pipeline.ledger().stats().total_bytes_used <= 500);
    }

    #[tokio::test]
    async fn test_cancellation_at_boundary() {
        struct CancelAfterFirst(CancellationFlag);

        #[async_trait::async_trait]
        impl BatchProcessor<u32> for CancelAfterFirst {
            async fn process_batch(&self, _batch: &[u32]) -> Result<()> {
                self.0.cancel();
                Ok(())
            }
        }

        let pipeline = orchestrator(1000, config(100, 2)).await;
        let processor = CancelAfterFirst(pipeline.cancellation_flag());
        let err = pipeline.run(&[1u32, 2, 3, 4], &processor).await.unwrap_err();
        assert!(matches!(err, GovernorError::Cancelled));
        assert_eq!(pipeline.state(), PipelineState::Cancelled);
        assert_eq!(pipeline.ledger().stats().count, 0);
    }

    #[tokio::test]
    async fn test_pressure_interrupts_run() {
        struct RaiseOnFirst(Arc<ManualPressure>);

        #[async_trait::async_trait]
        impl BatchProcessor<u32> for RaiseOnFirst {
            async fn process_batch(&self, _batch: &[u32]) -> Result<()> {
                self.0.raise();
                Ok(())
            }
        }

        let pipeline = Arc::new(orchestrator(1000, config(100, 2)).await);
        pipeline
            .cache
            .set("frame", CachedPayload::RawBytes(Bytes::from_static(b"px")), SetOptions::default())
            .await
            .unwrap();
        pipeline.ledger().lock().track(300, 0, 0).unwrap();

        let signal = Arc::new(ManualPressure::new());
        pipeline.attach_pressure(signal.as_ref());
        let mut events = pipeline.subscribe_events();

        let report = pipeline
            .run(&[1u32, 2, 3, 4], &RaiseOnFirst(signal.clone()))
            .await
            .unwrap();
        assert_eq!(report.outcome, PipelineState::Interrupted);
        assert_eq!(report.units_processed, 2);
        let pressure = report.pressure.unwrap();
        assert_eq!(pressure.cache_entries_cleared, 1);
        assert!(pressure.errors.is_empty());
        assert!(pipeline.cache.is_empty());
        assert!(pipeline.ledger().lock().utilization() <= 0.5);

        let mut saw_pressure = false;
        while let Ok(event) = events.try_recv() {
            saw_pressure |= matches!(event, StatusEvent::PressureHandled(_));
        }
        assert!(saw_pressure);

        pipeline.detach_pressure();
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_pressure_runs_emergency_pass() {
        let pipeline = Arc::new(orchestrator(1000, config(100, 2)).await);
        pipeline.ledger().lock().track(450, 0, 0).unwrap();
        pipeline.ledger().lock().track(450, 0, 0).unwrap();
        pipeline
            .cache
            .set("frame", CachedPayload::RawBytes(Bytes::from_static(b"px")), SetOptions::default())
            .await
            .unwrap();

        let signal = ManualPressure::new();
        pipeline.attach_pressure(&signal);
        let mut events = pipeline.subscribe_events();

        signal.raise();
        let report = loop {
            if let StatusEvent::PressureHandled(report) = events.recv().await.unwrap() {
                break report;
            }
        };
        assert_eq!(report.allocations_evicted, 1);
        assert_eq!(report.cache_entries_cleared, 1);
        assert!(!pipeline.pressure_pending());
        assert!(pipeline.ledger().lock().utilization() <= 0.5);

        let status = pipeline.status();
        assert_eq!(status.total_bytes_used, 450);
        assert_eq!(status.cache_entries, 0);
        assert_eq!(status.pipeline_state, PipelineState::Idle);

        // Nothing resumes on its own and the next run starts clean
        let recorder = Recorder::new(pipeline.ledger());
        let run = pipeline.run(&[1u32, 2, 3, 4], &recorder).await.unwrap();
        assert_eq!(run.outcome, PipelineState::Completed);
        assert_eq!(run.units_processed, 4);
        assert!(run.pressure.is_none());
    }

    #[tokio::test]
    async fn test_pressure_in_last_batch_is_handled_after_completion() {
        struct RaiseEveryBatch(Arc<ManualPressure>);

        #[async_trait::async_trait]
        impl BatchProcessor<u32> for RaiseEveryBatch {
            async fn process_batch(&self, _batch: &[u32]) -> Result<()> {
                self.0.raise();
                Ok(())
            }
        }

        let pipeline = Arc::new(orchestrator(1000, config(100, 2)).await);
        pipeline.ledger().lock().track(700, 0, 0).unwrap();
        let signal = Arc::new(ManualPressure::new());
        pipeline.attach_pressure(signal.as_ref());

        let report = pipeline
            .run(&[1u32, 2], &RaiseEveryBatch(signal.clone()))
            .await
            .unwrap();
        assert_eq!(report.outcome, PipelineState::Completed);
        assert_eq!(report.units_processed, 2);
        assert_eq!(report.pressure.unwrap().allocations_evicted, 1);
        assert!(!pipeline.pressure_pending());

        pipeline.detach_pressure();
        let recorder = Recorder::new(pipeline.ledger());
        let next = pipeline.run(&[1u32, 2, 3], &recorder).await.unwrap();
        assert_eq!(next.outcome, PipelineState::Completed);
        assert!(next.pressure.is_none());
    }

    #[tokio::test]
    async fn test_status_reflects_components() {
        let pipeline = orchestrator(1000, config(100, 2)).await;
        pipeline.ledger().lock().track(250, 10, 0).unwrap();

        let status = pipeline.status();
        assert_eq!(status.total_bytes_used, 250);
        assert_eq!(status.aux_bytes_used, 10);
        assert_eq!(status.num_tracked, 1);
        assert_eq!(status.pipeline_state, PipelineState::Idle);
        assert!((status.utilization_percentage - 25.0).abs() < 1e-9);
    }
}
