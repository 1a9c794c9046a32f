use std::sync::{Arc, PoisonError, RwLock};

/// Receives drift notifications from a timer worker.
///
/// Called on the worker thread between firings, so implementations must not
/// block; hand long work to another thread.
pub trait ScheduleListener: Send + Sync {
    /// The worker observed a task due `lag_ms` virtual milliseconds ago.
    fn behind_schedule(&self, lag_ms: i64);

    /// The worker caught up after having reported itself behind.
    fn on_schedule(&self);
}

/// Concurrency-safe list of [`ScheduleListener`]s.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn ScheduleListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ScheduleListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn ScheduleListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fire_behind_schedule(&self, lag_ms: i64) {
        for listener in self.snapshot() {
            listener.behind_schedule(lag_ms);
        }
    }

    pub fn fire_on_schedule(&self) {
        for listener in self.snapshot() {
            listener.on_schedule();
        }
    }

    /// Listeners are invoked outside the lock so they may (un)register freely.
    fn snapshot(&self) -> Vec<Arc<dyn ScheduleListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
