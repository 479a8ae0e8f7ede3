//! Memory pressure signal
//!
//! The host raises a pressure event when it is about to reclaim memory.
//! Handlers run on the raising thread and must not block; the orchestrator's
//! handler only flags the event and wakes the task that releases memory.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::warn;

/// Callback invoked on every pressure event
pub type PressureHandler = Arc<dyn Fn() + Send + Sync>;

/// Source of pressure events
pub trait PressureSignal: Send + Sync {
    /// Register `handler` until the returned [`Subscription`] is dropped
    fn subscribe(&self, handler: PressureHandler) -> Subscription;
}

/// Live registration with a [`PressureSignal`]
#[must_use = "dropping a subscription unsubscribes the handler"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Subscription whose drop runs `unsubscribe`
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

type Handlers = Mutex<BTreeMap<u64, PressureHandler>>;

/// Pressure source raised by hand
#[derive(Default)]
pub struct ManualPressure {
    handlers: Arc<Handlers>,
    next_id: AtomicU64,
    raised: AtomicU64,
}

impl fmt::Debug for ManualPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualPressure")
            .field("subscribers", &self.subscriber_count())
            .field("raised", &self.raised_count())
            .finish()
    }
}

fn lock(handlers: &Handlers) -> MutexGuard<'_, BTreeMap<u64, PressureHandler>> {
    handlers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ManualPressure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke every subscribed handler
    pub fn raise(&self) {
        self.raised.fetch_add(1, Ordering::SeqCst);
        let handlers: Vec<PressureHandler> = lock(&self.handlers).values().cloned().collect();
        warn!("Memory pressure raised ({} subscribers)", handlers.len());
        for handler in handlers {
            handler();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Times [`raise`](Self::raise) was called
    pub fn raised_count(&self) -> u64 {
        self.raised.load(Ordering::SeqCst)
    }
}

impl PressureSignal for ManualPressure {
    fn subscribe(&self, handler: PressureHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.handlers).insert(id, handler);

        let handlers: Weak<Handlers> = Arc::downgrade(&self.handlers);
        Subscription::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                lock(&handlers).remove(&id);
            }
        })
    }
}
