//! Governor configuration
//!
//! Budgets are fixed at construction. Nothing here is consulted again after a
//! ledger, cache or store has been built from it.

use crate::{GovernorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Resource ledger budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Maximum tracked bytes
    pub max_bytes: u64,
    /// Allocations with a priority above this are never auto-evicted
    pub pin_priority: i32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024, // 512MB
            pin_priority: crate::DEFAULT_PIN_PRIORITY,
        }
    }
}

impl LedgerConfig {
    /// Set the byte budget
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set the pin line
    pub fn with_pin_priority(mut self, pin_priority: i32) -> Self {
        self.pin_priority = pin_priority;
        self
    }
}

/// Ephemeral cache limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the backing cache bucket
    pub name: String,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum cached bytes
    pub max_bytes: u64,
    /// TTL applied when `set` does not specify one
    pub default_ttl_ms: u64,
    /// Background cleanup period
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "vesper-ephemeral".into(),
            max_entries: 256,
            max_bytes: 128 * 1024 * 1024, // 128MB
            default_ttl_ms: 5 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
        }
    }
}

impl CacheConfig {
    /// Set maximum entry count
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set maximum cached bytes
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set default TTL
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Cleanup period as a duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Durable store layout and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database name
    pub database: String,
    /// Schema version passed to the backend on open
    pub version: u32,
    /// Logical stores inside the database
    pub stores: Vec<String>,
    /// Default chunk size in bytes
    pub chunk_size: usize,
    /// Extra read attempts after a checksum mismatch
    pub max_checksum_retries: u32,
    /// How long a writer waits for the same key before giving up
    pub lock_timeout_ms: u64,
    /// Quota utilization above which saves fail fast
    pub quota_admission_ratio: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: "vesper".into(),
            version: crate::SCHEMA_VERSION,
            stores: vec!["tensors".into(), "checkpoints".into()],
            chunk_size: 1024 * 1024, // 1MB
            max_checksum_retries: 2,
            lock_timeout_ms: 10_000,
            quota_admission_ratio: 0.9,
        }
    }
}

impl StoreConfig {
    /// Set the database name
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Replace the logical store list
    pub fn with_stores<I, S>(mut self, stores: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stores = stores.into_iter().map(Into::into).collect();
        self
    }

    /// Set default chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set checksum retry count
    pub fn with_max_checksum_retries(mut self, retries: u32) -> Self {
        self.max_checksum_retries = retries;
        self
    }

    /// Set per-key lock timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Lock timeout as a duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Batch sizing and backpressure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Host bytes each unit of work holds while in flight
    pub per_unit_cost: u64,
    /// GPU-side bytes each unit holds
    pub aux_per_unit: u64,
    /// Ledger priority of per-unit allocations
    pub unit_priority: i32,
    /// Fraction of headroom a batch may claim
    pub safety_factor: f64,
    /// Upper bound on units per batch
    pub max_batch: usize,
    /// Projected utilization that triggers proactive cleanup
    pub cleanup_threshold: f64,
    /// Ledger utilization the emergency pass evicts down to
    pub emergency_target: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            per_unit_cost: 16 * 1024 * 1024, // 16MB
            aux_per_unit: 0,
            unit_priority: 0,
            safety_factor: 0.8,
            max_batch: 8,
            cleanup_threshold: 0.85,
            emergency_target: 0.5,
        }
    }
}

impl PipelineConfig {
    /// Set per-unit cost
    pub fn with_per_unit_cost(mut self, cost: u64) -> Self {
        self.per_unit_cost = cost;
        self
    }

    /// Set maximum batch size
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Set safety factor
    pub fn with_safety_factor(mut self, safety_factor: f64) -> Self {
        self.safety_factor = safety_factor;
        self
    }

    /// Set cleanup threshold
    pub fn with_cleanup_threshold(mut self, threshold: f64) -> Self {
        self.cleanup_threshold = threshold;
        self
    }
}

/// Complete configuration for one execution context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub ledger: LedgerConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
}

impl GovernorConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Check every budget for consistency
    pub fn validate(&self) -> Result<()> {
        if self.ledger.max_bytes == 0 {
            return Err(invalid("ledger.max_bytes must be positive"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be positive"));
        }
        if self.cache.name.is_empty() {
            return Err(invalid("cache.name must not be empty"));
        }
        if self.store.chunk_size == 0 {
            return Err(invalid("store.chunk_size must be positive"));
        }
        if self.store.stores.is_empty() {
            return Err(invalid("store.stores must name at least one store"));
        }
        for (i, name) in self.store.stores.iter().enumerate() {
            if name.is_empty() || name.ends_with(crate::store::CHUNK_STORE_SUFFIX) {
                return Err(invalid(format!("store name {name:?} is reserved")));
            }
            if self.store.stores[..i].contains(name) {
                return Err(invalid(format!("store name {name:?} is duplicated")));
            }
        }
        check_ratio("store.quota_admission_ratio", self.store.quota_admission_ratio)?;
        if self.pipeline.per_unit_cost == 0 {
            return Err(invalid("pipeline.per_unit_cost must be positive"));
        }
        if self.pipeline.max_batch == 0 {
            return Err(invalid("pipeline.max_batch must be at least 1"));
        }
        check_ratio("pipeline.safety_factor", self.pipeline.safety_factor)?;
        check_ratio("pipeline.cleanup_threshold", self.pipeline.cleanup_threshold)?;
        if !(0.0..=1.0).contains(&self.pipeline.emergency_target) {
            return Err(invalid("pipeline.emergency_target must be within [0, 1]"));
        }
        Ok(())
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn check_ratio(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be within (0, 1], got {value}")))
    }
}

fn invalid(msg: impl Into<String>) -> GovernorError {
    GovernorError::InvalidConfig(msg.into())
}
