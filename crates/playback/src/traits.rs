use std::sync::Arc;

use histplay_core::{HistoryRecord, PublishedUpdate, UpdateId, VirtualTime};

use crate::error::PublishError;

/// Called with the new clock position after a seek.
pub type ClockTimeSetHandler = Box<dyn Fn(VirtualTime) + Send + Sync>;

/// Called on playback state transitions.
pub type PlaybackEventHandler = Box<dyn Fn() + Send + Sync>;

// ── PlaybackControl ──────────────────────────────────────────────────

/// The user-facing player: its clock, speed and play/stop state.
///
/// `pause`/`resume` are a synchronisation hold used for backpressure. They
/// freeze the clock without changing what [`is_playing`](Self::is_playing)
/// reports, and must not invoke any registered handler.
///
/// Handlers may be called on any thread and must not be invoked while the
/// implementation holds its own locks.
pub trait PlaybackControl: Send + Sync {
    fn is_playing(&self) -> bool;

    /// Virtual milliseconds per real millisecond.
    fn speed(&self) -> f64;

    fn clock_time(&self) -> VirtualTime;

    fn pause(&self);

    fn resume(&self);

    /// Fires after the clock has been moved to a new position.
    fn on_clock_time_set(&self, handler: ClockTimeSetHandler);

    /// Fires when the user starts playback, before the clock runs.
    fn on_playback_starting(&self, handler: PlaybackEventHandler);

    /// Fires when the user stops playback.
    fn on_stopped(&self, handler: PlaybackEventHandler);
}

// ── HistoryStore ─────────────────────────────────────────────────────

/// Read access to loaded history.
pub trait HistoryStore: Send + Sync {
    /// Every id currently replayed.
    fn tracked_ids(&self) -> Vec<UpdateId>;

    /// All records for `id` in timestamp order. Empty if unknown.
    fn records_for(&self, id: UpdateId) -> Vec<HistoryRecord>;

    /// The latest record with `timestamp <= time`.
    fn value_at(&self, id: UpdateId, time: VirtualTime) -> Option<HistoryRecord>;

    /// Whether history for `id` has finished loading.
    fn is_initialized(&self, id: UpdateId) -> bool;
}

impl<T: HistoryStore + ?Sized> HistoryStore for Arc<T> {
    fn tracked_ids(&self) -> Vec<UpdateId> {
        (**self).tracked_ids()
    }

    fn records_for(&self, id: UpdateId) -> Vec<HistoryRecord> {
        (**self).records_for(id)
    }

    fn value_at(&self, id: UpdateId, time: VirtualTime) -> Option<HistoryRecord> {
        (**self).value_at(id, time)
    }

    fn is_initialized(&self, id: UpdateId) -> bool {
        (**self).is_initialized(id)
    }
}

// ── PublishSink ──────────────────────────────────────────────────────

/// Downstream consumer of replayed updates.
///
/// Live updates are published from the timer worker thread; keep this fast.
pub trait PublishSink: Send + Sync {
    fn publish(&self, update: PublishedUpdate) -> Result<(), PublishError>;
}

impl<T: PublishSink + ?Sized> PublishSink for Arc<T> {
    fn publish(&self, update: PublishedUpdate) -> Result<(), PublishError> {
        (**self).publish(update)
    }
}

// ── BatchUpdateListener ──────────────────────────────────────────────

/// Brackets the batch of initial values published after a (re)initialisation.
pub trait BatchUpdateListener: Send + Sync {
    fn on_batch_update_start(&self, ids: &[UpdateId]);

    fn on_batch_update_finish(&self, ids: &[UpdateId]);
}
