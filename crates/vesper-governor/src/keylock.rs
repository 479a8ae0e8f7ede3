//! Per-key async locks
//!
//! An entry exists only while some task holds or waits for its key; the
//! last one out removes it.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutexes keyed by `K`
#[derive(Debug)]
pub(crate) struct KeyLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`
    pub(crate) async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let claim = self.claim(key);
        let held = Arc::clone(&claim.mutex).lock_owned().await;
        KeyGuard {
            _held: held,
            _claim: claim,
        }
    }

    /// Like [`lock`](Self::lock); `None` once `timeout` passes
    pub(crate) async fn lock_timeout(&self, key: K, timeout: Duration) -> Option<KeyGuard<'_, K>> {
        let claim = self.claim(key);
        let held = tokio::time::timeout(timeout, Arc::clone(&claim.mutex).lock_owned())
            .await
            .ok()?;
        Some(KeyGuard {
            _held: held,
            _claim: claim,
        })
    }

    fn claim(&self, key: K) -> Claim<'_, K> {
        let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        Claim {
            locks: &self.locks,
            key,
            mutex,
        }
    }

    /// Drop entries nobody holds or waits on
    pub(crate) fn release_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Interest in one key, held from the first wait until release
struct Claim<'a, K: Eq + Hash> {
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
    mutex: Arc<Mutex<()>>,
}

impl<K: Eq + Hash> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        // Two references left: the map's and ours
        self.locks.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.mutex) && Arc::strong_count(lock) == 2
        });
    }
}

/// Exclusive access to one key; released on drop
pub(crate) struct KeyGuard<'a, K: Eq + Hash> {
    // Field order matters: the mutex unlocks before the claim is dropped
    _held: OwnedMutexGuard<()>,
    _claim: Claim<'a, K>,
}
