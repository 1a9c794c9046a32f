use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::{debug, error, info, warn};

use histplay_core::config::{Config, ReplayConfig, TimerConfig};
use histplay_core::{format_virtual_time, sort_supervision_last, PublishedUpdate, UpdateId, VirtualTime};
use histplay_timer::{ScheduleListener, SchedulerError, Task, TaskError, TimerMetrics, TimerQueue, VirtualClock};

use crate::clock::PlaybackClock;
use crate::drift_guard::DriftGuard;
use crate::error::PlaybackError;
use crate::traits::{BatchUpdateListener, HistoryStore, PlaybackControl, PublishSink};

/// Drives historical playback: keeps the sink showing the value at the
/// current virtual time and fires every later record when the clock reaches it.
///
/// Each (re)initialisation discards the current timer and builds a new one;
/// the old worker finds its queue closed and exits on its own. While playback
/// is stopped, scheduling is deferred until the next playback start.
pub struct ReplayCoordinator {
    control: Arc<dyn PlaybackControl>,
    store: Arc<dyn HistoryStore>,
    sink: Arc<dyn PublishSink>,
    clock: Arc<dyn VirtualClock>,
    drift: Arc<DriftGuard>,
    timer_config: TimerConfig,
    replay_config: ReplayConfig,
    timer: Mutex<Option<Arc<TimerQueue>>>,
    /// Serialises whole scheduling passes.
    scheduling: Mutex<()>,
    needs_rescheduling: AtomicBool,
    generation: AtomicU64,
    batch_listeners: RwLock<Vec<Arc<dyn BatchUpdateListener>>>,
}

impl ReplayCoordinator {
    /// Create a coordinator that is not yet subscribed to playback events.
    /// Most callers want [`attach`](Self::attach).
    pub fn new(
        control: Arc<dyn PlaybackControl>,
        store: Arc<dyn HistoryStore>,
        sink: Arc<dyn PublishSink>,
        config: &Config,
    ) -> Self {
        let clock: Arc<dyn VirtualClock> = Arc::new(PlaybackClock::new(
            Arc::clone(&control),
            config.replay.behind_schedule_threshold_ms,
        ));
        let drift = Arc::new(DriftGuard::new(Arc::clone(&control), &config.drift));
        Self {
            control,
            store,
            sink,
            clock,
            drift,
            timer_config: config.timer.clone(),
            replay_config: config.replay.clone(),
            timer: Mutex::new(None),
            scheduling: Mutex::new(()),
            needs_rescheduling: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            batch_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Create a coordinator and subscribe it to the playback control:
    /// a clock time change rebuilds, a playback start schedules pending
    /// events, a stop interrupts any drift pause.
    pub fn attach(
        control: Arc<dyn PlaybackControl>,
        store: Arc<dyn HistoryStore>,
        sink: Arc<dyn PublishSink>,
        config: &Config,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self::new(Arc::clone(&control), store, sink, config));

        let weak: Weak<Self> = Arc::downgrade(&coordinator);
        control.on_clock_time_set(Box::new(move |time: VirtualTime| {
            if let Some(c) = weak.upgrade() {
                debug!(at = %format_virtual_time(time), "clock time set");
                c.reschedule_events();
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(&coordinator);
        control.on_playback_starting(Box::new(move || {
            if let Some(c) = weak.upgrade() {
                c.on_playback_starting();
            }
        }));

        coordinator.drift.watch_stopped();
        coordinator
    }

    // ── Triggers ─────────────────────────────────────────────────────

    /// Full rebuild at the current clock time: discard scheduled events,
    /// publish the value at now for every tracked id, then schedule the
    /// future records (now if playing, else on the next playback start).
    ///
    /// Publishing and scheduling share one reading of the clock, so a record
    /// that becomes due while the initial batch is being published is still
    /// scheduled and fires late instead of being skipped.
    pub fn reschedule_events(&self) {
        self.cancel_all_scheduled_events();
        self.needs_rescheduling.store(true, Ordering::SeqCst);
        let now = self.control.clock_time();
        let ids = self.store.tracked_ids();
        self.publish_values_at(&ids, now);
        if self.control.is_playing() {
            self.reschedule_if_needed(now);
        }
    }

    /// The set of tracked ids changed.
    pub fn on_tracked_ids_changed(&self) {
        self.reschedule_events();
    }

    /// Playback is about to start.
    pub fn on_playback_starting(&self) {
        self.reschedule_if_needed(self.control.clock_time());
    }

    /// Drop the current timer and everything queued on it. Does not wait for
    /// a callback that is already running.
    pub fn cancel_all_scheduled_events(&self) {
        if let Some(old) = self.lock_timer().take() {
            debug!(timer = %old.name(), "cancelling scheduled events");
            self.retire(&old);
        }
    }

    /// Detach the drift guard from a replaced timer and cancel it, so a
    /// worker still draining cannot report drift into the live guard.
    fn retire(&self, timer: &TimerQueue) {
        let drift: Arc<dyn ScheduleListener> = self.drift.clone();
        timer.remove_listener(&drift);
        timer.cancel();
    }

    // ── Initial values ───────────────────────────────────────────────

    /// Publish the value at the current clock time for every tracked id.
    pub fn update_with_value_at_current_time(&self) -> usize {
        let ids = self.store.tracked_ids();
        self.update_ids_with_value_at_current_time(&ids)
    }

    /// Publish the value at the current clock time for `ids`, supervision
    /// streams last. Ids whose history is still loading are skipped; an id
    /// without a value gets an invalidation placeholder. Sink failures are
    /// logged and do not stop the batch. Returns how many updates reached the sink.
    pub fn update_ids_with_value_at_current_time(&self, ids: &[UpdateId]) -> usize {
        self.publish_values_at(ids, self.control.clock_time())
    }

    fn publish_values_at(&self, ids: &[UpdateId], now: VirtualTime) -> usize {
        let mut sorted = ids.to_vec();
        sort_supervision_last(&mut sorted);
        debug!(ids = sorted.len(), at = %format_virtual_time(now), "publishing values at current time");

        let listeners = self.batch_listener_snapshot();
        for listener in &listeners {
            listener.on_batch_update_start(&sorted);
        }

        let mut published = 0;
        for &id in &sorted {
            if !self.store.is_initialized(id) {
                continue;
            }
            let update = match self.store.value_at(id, now) {
                Some(record) => PublishedUpdate::Initial(record),
                None => PublishedUpdate::Invalidated {
                    id,
                    time: now,
                    reason: self.replay_config.invalid_reason.clone(),
                },
            };
            match self.sink.publish(update) {
                Ok(()) => published += 1,
                Err(e) => warn!(id = %id, error = %e, "failed to publish value at current time"),
            }
        }

        for listener in &listeners {
            listener.on_batch_update_finish(&sorted);
        }
        published
    }

    // ── Scheduling ───────────────────────────────────────────────────

    fn reschedule_if_needed(&self, from: VirtualTime) {
        if self
            .needs_rescheduling
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!(at = %format_virtual_time(from), "playback reinitialised");
        match self.schedule_events(from) {
            Ok(count) => debug!(count, "history events scheduled"),
            Err(e) => error!(error = %e, "failed to schedule history events"),
        }
    }

    /// Build a fresh timer and submit one task per record at or after `from`.
    fn schedule_events(&self, from: VirtualTime) -> Result<usize, PlaybackError> {
        let _pass = self.scheduling.lock().unwrap_or_else(PoisonError::into_inner);
        let timer = self.replace_timer()?;

        let mut count = 0;
        for id in self.store.tracked_ids() {
            let mut last: Option<VirtualTime> = None;
            for record in self.store.records_for(id) {
                if record.timestamp < from {
                    continue;
                }
                let execution_time = next_execution_time(last, record.timestamp);
                last = Some(execution_time);

                let sink = Arc::clone(&self.sink);
                let task = Task::new(format!("{id}@{}", record.timestamp), move || {
                    sink.publish(PublishedUpdate::Live(record.clone()))
                        .map_err(|e| TaskError::Failed(e.to_string()))
                });
                match timer.schedule_at(&task, execution_time) {
                    Ok(()) => count += 1,
                    Err(SchedulerError::SchedulerClosed) => {
                        // A newer rebuild replaced this timer and will schedule everything itself.
                        debug!(timer = %timer.name(), "event scheduling superseded");
                        return Ok(count);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(count)
    }

    /// Install a new timer wired to the drift guard, cancelling the previous one.
    fn replace_timer(&self) -> Result<Arc<TimerQueue>, PlaybackError> {
        let n = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{n}", self.timer_config.thread_name_prefix);
        let timer = Arc::new(TimerQueue::named(name, Arc::clone(&self.clock), &self.timer_config)?);
        let drift: Arc<dyn ScheduleListener> = self.drift.clone();
        timer.add_listener(drift);

        let old = self.lock_timer().replace(Arc::clone(&timer));
        if let Some(old) = old {
            self.retire(&old);
        }
        info!(timer = %timer.name(), "timer created");
        Ok(timer)
    }

    // ── Observers & inspection ───────────────────────────────────────

    pub fn add_batch_listener(&self, listener: Arc<dyn BatchUpdateListener>) {
        self.batch_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a batch listener by identity. Returns whether it was registered.
    pub fn remove_batch_listener(&self, listener: &Arc<dyn BatchUpdateListener>) -> bool {
        let mut listeners = self.batch_listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Whether future records still need to be scheduled on the next start.
    pub fn needs_rescheduling(&self) -> bool {
        self.needs_rescheduling.load(Ordering::SeqCst)
    }

    pub fn has_active_timer(&self) -> bool {
        self.lock_timer().is_some()
    }

    /// Metrics of the current timer, if one is active.
    pub fn timer_metrics(&self) -> Option<TimerMetrics> {
        self.lock_timer().as_ref().map(|t| t.metrics())
    }

    pub fn drift_guard(&self) -> &Arc<DriftGuard> {
        &self.drift
    }

    /// The clock timers are bound to.
    pub fn clock(&self) -> &Arc<dyn VirtualClock> {
        &self.clock
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<Arc<TimerQueue>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn batch_listener_snapshot(&self) -> Vec<Arc<dyn BatchUpdateListener>> {
        self.batch_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for ReplayCoordinator {
    fn drop(&mut self) {
        self.cancel_all_scheduled_events();
    }
}

/// Execution time for a record given the previous one scheduled for the same
/// id: records sharing (or preceding) the last slot move 1ms past it, so
/// firings per id are strictly increasing.
pub fn next_execution_time(last: Option<VirtualTime>, timestamp: VirtualTime) -> VirtualTime {
    match last {
        Some(last) if timestamp <= last => last + 1,
        _ => timestamp,
    }
}
