//! Per-context governor instances
//!
//! A [`WorkerContext`] owns everything one execution context needs: its
//! backends, ledger, cache, store and orchestrator. Nothing is shared
//! between contexts.

use crate::error::{Result, WorkerError};
use crate::protocol::{WorkerRequest, WorkerResponse};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use vesper_governor::backend::{
    DurableBlobStore, EphemeralBlobStore, FsDurableStore, ManualQuota, MemoryDurableStore,
    MemoryEphemeralStore,
};
use vesper_governor::{
    AllocationId, CachedPayload, CleanupTask, EphemeralCache, GovernorConfig, ManualPressure,
    PersistentStore, PipelineOrchestrator, PressureReport, QuotaEstimator, QuotaOracle,
    SaveOptions, SetOptions, SharedLedger, StatusEvent,
};

/// How long a `pressure` request waits for the emergency pass to report
const PRESSURE_REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Host primitives a context is built on
#[derive(Clone)]
pub struct Backends {
    pub ephemeral: Arc<dyn EphemeralBlobStore>,
    pub durable: Arc<dyn DurableBlobStore>,
    pub quota: Arc<dyn QuotaEstimator>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

impl Backends {
    /// In-memory stores charging one shared quota of `quota_bytes`
    pub fn in_memory(quota_bytes: u64) -> Self {
        let quota = Arc::new(ManualQuota::new(0, quota_bytes));
        Self {
            ephemeral: Arc::new(MemoryEphemeralStore::with_quota(quota.clone())),
            durable: Arc::new(MemoryDurableStore::with_quota(quota.clone())),
            quota,
        }
    }

    /// In-memory cache with records persisted under `dir`
    pub fn with_store_dir(dir: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        let quota = Arc::new(ManualQuota::new(0, quota_bytes));
        Self {
            ephemeral: Arc::new(MemoryEphemeralStore::with_quota(quota.clone())),
            durable: Arc::new(FsDurableStore::new(dir)),
            quota,
        }
    }
}

/// Components built by `init`
struct Governor {
    ledger: SharedLedger,
    cache: Arc<EphemeralCache>,
    store: Arc<PersistentStore>,
    pipeline: Arc<PipelineOrchestrator>,
    _cleanup: CleanupTask,
}

/// State owned by one worker
pub struct WorkerContext {
    backends: Backends,
    pressure: ManualPressure,
    governor: Option<Governor>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            pressure: ManualPressure::new(),
            governor: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.governor.is_some()
    }

    /// Build (or rebuild) the governor from `config`
    ///
    /// Must run inside a tokio runtime; the cache cleanup task is spawned
    /// here.
    pub async fn init(&mut self, config: GovernorConfig) -> Result<()> {
        config.validate()?;
        // Drop the previous governor first so its cleanup task stops
        self.governor = None;

        let oracle = QuotaOracle::new(self.backends.quota.clone());
        let ledger = SharedLedger::from_config(config.ledger.clone());
        let cache = Arc::new(
            EphemeralCache::open(
                self.backends.ephemeral.clone(),
                oracle.clone(),
                config.cache.clone(),
            )
            .await?,
        );
        let store = Arc::new(
            PersistentStore::open(self.backends.durable.as_ref(), oracle, config.store.clone())
                .await?,
        );
        let pipeline = Arc::new(PipelineOrchestrator::new(
            ledger.clone(),
            cache.clone(),
            store.clone(),
            config.pipeline.clone(),
        ));
        pipeline.attach_pressure(&self.pressure);
        let cleanup = cache.spawn_cleanup_task(config.cache.cleanup_interval());

        info!(
            "Worker initialized: ledger {} bytes, cache {}, database {}",
            config.ledger.max_bytes, config.cache.name, config.store.database
        );
        self.governor = Some(Governor {
            ledger,
            cache,
            store,
            pipeline,
            _cleanup: cleanup,
        });
        Ok(())
    }

    fn governor(&self) -> Result<&Governor> {
        self.governor.as_ref().ok_or(WorkerError::NotInitialized)
    }

    /// Answer one request; failures become `error` responses
    pub async fn handle(&mut self, request: WorkerRequest) -> WorkerResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request failed: {}", e);
                WorkerResponse::error(e.kind(), e)
            }
        }
    }

    async fn dispatch(&mut self, request: WorkerRequest) -> Result<WorkerResponse> {
        debug!("Handling {} request", request_name(&request));
        match request {
            WorkerRequest::Init { config } => {
                self.init(config).await?;
                Ok(WorkerResponse::Initialized)
            }
            WorkerRequest::Track {
                size_bytes,
                aux_bytes,
                priority,
                label,
            } => {
                let id = self.track(size_bytes, aux_bytes, priority, label)?;
                Ok(WorkerResponse::Tracked { id })
            }
            WorkerRequest::Touch { id } => {
                let touched = self.governor()?.ledger.lock().touch(id);
                Ok(WorkerResponse::Touched { touched })
            }
            WorkerRequest::Release { id } => {
                let released = self.governor()?.ledger.lock().release(id);
                Ok(WorkerResponse::Released { released })
            }
            WorkerRequest::Evict { target } => {
                let count = self.governor()?.ledger.lock().evict_to_threshold(target);
                Ok(WorkerResponse::Evicted { count })
            }
            WorkerRequest::CacheSet {
                key,
                payload,
                ttl_ms,
                priority,
            } => {
                let mut options = SetOptions::default().with_priority(priority);
                if let Some(ttl_ms) = ttl_ms {
                    options = options.with_ttl(Duration::from_millis(ttl_ms));
                }
                self.governor()?
                    .cache
                    .set(&key, CachedPayload::RawBytes(Bytes::from(payload)), options)
                    .await?;
                Ok(WorkerResponse::Cached)
            }
            WorkerRequest::CacheGet { key } => {
                let payload = self
                    .governor()?
                    .cache
                    .get(&key)
                    .await?
                    .map(|p| p.data().to_vec());
                Ok(WorkerResponse::CacheValue { payload })
            }
            WorkerRequest::CacheCleanup => {
                let report = self.governor()?.cache.cleanup().await?;
                Ok(WorkerResponse::CacheCleaned(report))
            }
            WorkerRequest::Save {
                store,
                key,
                payload,
                chunk_size,
            } => {
                let options = SaveOptions { chunk_size };
                let manifest = self
                    .governor()?
                    .store
                    .save(&store, &key, Bytes::from(payload), options)
                    .await?;
                Ok(WorkerResponse::Saved {
                    generation: manifest.generation,
                    chunks: manifest.chunks.len(),
                })
            }
            WorkerRequest::Load { store, key } => {
                let payload = self.governor()?.store.load(&store, &key).await?;
                Ok(WorkerResponse::Loaded {
                    payload: payload.to_vec(),
                })
            }
            WorkerRequest::Delete { store, key } => {
                let deleted = self.governor()?.store.delete(&store, &key).await?;
                Ok(WorkerResponse::Deleted { deleted })
            }
            WorkerRequest::Clear { store } => {
                let count = self.governor()?.store.clear(&store).await?;
                Ok(WorkerResponse::Cleared { count })
            }
            WorkerRequest::Pressure => {
                let mut events = self.governor()?.pipeline.subscribe_events();
                self.pressure.raise();
                let report = wait_for_pressure_report(&mut events).await?;
                Ok(WorkerResponse::PressureHandled(report))
            }
            WorkerRequest::Status => Ok(WorkerResponse::Status(self.governor()?.pipeline.status())),
            WorkerRequest::Shutdown => {
                info!("Worker shutting down");
                Ok(WorkerResponse::ShuttingDown)
            }
        }
    }

    fn track(
        &self,
        size_bytes: u64,
        aux_bytes: u64,
        priority: i32,
        label: Option<String>,
    ) -> Result<AllocationId> {
        let mut ledger = self.governor()?.ledger.lock();
        let id = match label {
            Some(label) => ledger.track_labeled(size_bytes, aux_bytes, priority, label)?,
            None => ledger.track(size_bytes, aux_bytes, priority)?,
        };
        Ok(id)
    }

    /// Ledger of the initialized governor
    pub fn ledger(&self) -> Option<&SharedLedger> {
        self.governor.as_ref().map(|g| &g.ledger)
    }

    /// Whether `id` is still tracked
    pub fn is_tracked(&self, id: AllocationId) -> bool {
        self.ledger().is_some_and(|l| l.lock().contains(id))
    }
}

/// Wait for the orchestrator to finish the pass a raised signal started
async fn wait_for_pressure_report(
    events: &mut broadcast::Receiver<StatusEvent>,
) -> Result<PressureReport> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(StatusEvent::PressureHandled(report)) => return Ok(report),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(WorkerError::ChannelClosed("pipeline events closed".into()))
                }
            }
        }
    };
    tokio::time::timeout(PRESSURE_REPORT_TIMEOUT, wait)
        .await
        .map_err(|_| WorkerError::ChannelClosed("no pressure report from the pipeline".into()))?
}

fn request_name(request: &WorkerRequest) -> &'static str {
    match request {
        WorkerRequest::Init { .. } => "init",
        WorkerRequest::Track { .. } => "track",
        WorkerRequest::Touch { .. } => "touch",
        WorkerRequest::Release { .. } => "release",
        WorkerRequest::Evict { .. } => "evict",
        WorkerRequest::CacheSet { .. } => "cache_set",
        WorkerRequest::CacheGet { .. } => "cache_get",
        WorkerRequest::CacheCleanup => "cache_cleanup",
        WorkerRequest::Save { .. } => "save",
        WorkerRequest::Load { .. } => "load",
        WorkerRequest::Delete { .. } => "delete",
        WorkerRequest::Clear { .. } => "clear",
        WorkerRequest::Pressure => "pressure",
        WorkerRequest::Status => "status",
        WorkerRequest::Shutdown => "shutdown",
    }
}
