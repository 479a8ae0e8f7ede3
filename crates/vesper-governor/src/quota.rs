//! Storage quota snapshots

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Raw answer from the host quota primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEstimate {
    /// Bytes the origin currently uses
    pub usage_bytes: u64,
    /// Bytes the origin may use
    pub quota_bytes: u64,
}

/// Host quota query primitive
#[async_trait::async_trait]
pub trait QuotaEstimator: Send + Sync {
    /// Ask the host for current usage
    async fn estimate(&self) -> Result<QuotaEstimate>;
}

/// Point-in-time quota reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaSnapshot {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub observed_at: Instant,
}

impl QuotaSnapshot {
    /// Fraction of quota in use; an empty quota counts as full
    pub fn utilization(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }

    /// Bytes still available
    pub fn headroom(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    /// Whether `bytes` more would still fit
    pub fn fits(&self, bytes: u64) -> bool {
        bytes <= self.headroom()
    }
}

/// Uniform, never-cached view over a [`QuotaEstimator`]
#[derive(Clone)]
pub struct QuotaOracle {
    estimator: Arc<dyn QuotaEstimator>,
}

impl fmt::Debug for QuotaOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaOracle").finish_non_exhaustive()
    }
}

impl QuotaOracle {
    /// Wrap an estimator
    pub fn new(estimator: Arc<dyn QuotaEstimator>) -> Self {
        Self { estimator }
    }

    /// Query the host; every call re-queries
    pub async fn snapshot(&self) -> Result<QuotaSnapshot> {
        let estimate = self.estimator.estimate().await?;
        let snapshot = QuotaSnapshot {
            used_bytes: estimate.usage_bytes,
            total_bytes: estimate.quota_bytes,
            observed_at: Instant::now(),
        };
        debug!(
            "Quota snapshot: {}/{} bytes ({:.1}%)",
            snapshot.used_bytes,
            snapshot.total_bytes,
            snapshot.utilization() * 100.0
        );
        Ok(snapshot)
    }
}
