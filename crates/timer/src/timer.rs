use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use tracing::debug;

use histplay_core::VirtualTime;
use histplay_core::config::TimerConfig;

use crate::clock::VirtualClock;
use crate::error::SchedulerError;
use crate::listener::{ListenerRegistry, ScheduleListener};
use crate::metrics::TimerMetrics;
use crate::queue::QueueEntry;
use crate::task::{Task, TaskState};
use crate::worker::{Shared, TimerWorker};

/// Public scheduling API over a task queue and its dedicated worker thread.
///
/// Creating a `TimerQueue` starts exactly one worker bound to the given clock.
/// [`cancel`](TimerQueue::cancel) (or dropping the queue) discards pending
/// tasks and lets the worker exit on its own; neither waits for it. A
/// cancelled queue is never reused: build a new one instead.
///
/// Relative delays are measured from `clock.time()`, i.e. in virtual time.
pub struct TimerQueue {
    name: String,
    shared: Arc<Shared>,
    clock: Arc<dyn VirtualClock>,
    listeners: Arc<ListenerRegistry>,
    metrics: Arc<RwLock<TimerMetrics>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    /// Create a timer with default settings.
    pub fn new(clock: Arc<dyn VirtualClock>) -> Result<Self, SchedulerError> {
        Self::with_config(clock, &TimerConfig::default())
    }

    /// Create a timer whose worker thread is named after the configured prefix.
    pub fn with_config(clock: Arc<dyn VirtualClock>, config: &TimerConfig) -> Result<Self, SchedulerError> {
        Self::named(config.thread_name_prefix.clone(), clock, config)
    }

    /// Create a timer with an explicit worker thread name.
    pub fn named(
        name: impl Into<String>,
        clock: Arc<dyn VirtualClock>,
        config: &TimerConfig,
    ) -> Result<Self, SchedulerError> {
        let name = name.into();
        let shared = Arc::new(Shared::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let metrics = Arc::new(RwLock::new(TimerMetrics::default()));

        let worker = TimerWorker::new(
            name.clone(),
            Arc::clone(&shared),
            Arc::clone(&clock),
            Arc::clone(&listeners),
            Arc::clone(&metrics),
            config,
        );
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())?;

        Ok(Self {
            name,
            shared,
            clock,
            listeners,
            metrics,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn VirtualClock> {
        &self.clock
    }

    // ── One-shot ─────────────────────────────────────────────────────

    /// Fire `task` once at virtual time `time`.
    pub fn schedule_at(&self, task: &Arc<Task>, time: VirtualTime) -> Result<(), SchedulerError> {
        self.sched(task, time, 0)
    }

    /// Fire `task` once, `delay_ms` virtual milliseconds from now.
    pub fn schedule_after(&self, task: &Arc<Task>, delay_ms: i64) -> Result<(), SchedulerError> {
        let time = self.time_after(delay_ms)?;
        self.sched(task, time, 0)
    }

    // ── Fixed delay ──────────────────────────────────────────────────

    /// Repeat every `period_ms` measured from each actual firing; late
    /// firings push all later ones back.
    pub fn schedule_fixed_delay_at(
        &self,
        task: &Arc<Task>,
        first_time: VirtualTime,
        period_ms: i64,
    ) -> Result<(), SchedulerError> {
        check_period(period_ms)?;
        self.sched(task, first_time, -period_ms)
    }

    pub fn schedule_fixed_delay_after(
        &self,
        task: &Arc<Task>,
        delay_ms: i64,
        period_ms: i64,
    ) -> Result<(), SchedulerError> {
        let time = self.time_after(delay_ms)?;
        check_period(period_ms)?;
        self.sched(task, time, -period_ms)
    }

    // ── Fixed rate ───────────────────────────────────────────────────

    /// Repeat every `period_ms` measured from the first execution time; after
    /// a late firing the missed occurrences run back-to-back.
    pub fn schedule_fixed_rate_at(
        &self,
        task: &Arc<Task>,
        first_time: VirtualTime,
        period_ms: i64,
    ) -> Result<(), SchedulerError> {
        check_period(period_ms)?;
        self.sched(task, first_time, period_ms)
    }

    pub fn schedule_fixed_rate_after(
        &self,
        task: &Arc<Task>,
        delay_ms: i64,
        period_ms: i64,
    ) -> Result<(), SchedulerError> {
        let time = self.time_after(delay_ms)?;
        check_period(period_ms)?;
        self.sched(task, time, period_ms)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Stop accepting tasks and discard pending ones. Idempotent. A callback
    /// already running is not interrupted.
    pub fn cancel(&self) {
        debug!(timer = %self.name, "timer cancelled");
        self.shared.close();
    }

    pub fn is_cancelled(&self) -> bool {
        !self.shared.lock().accepting
    }

    /// Remove cancelled tasks from the queue, returning how many were removed.
    pub fn purge(&self) -> Result<usize, SchedulerError> {
        let removed = {
            let mut state = self.shared.lock();
            if !state.accepting {
                return Err(SchedulerError::SchedulerClosed);
            }
            state.queue.purge_cancelled()
        };
        if removed > 0 {
            self.metrics
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .tasks_purged += removed as u64;
        }
        Ok(removed)
    }

    /// Number of entries in the queue, including cancelled ones not yet swept.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Cancel and wait for the worker thread to exit.
    ///
    /// Must not be called from inside a task callback; from the worker thread
    /// this only cancels.
    pub fn join(&self) {
        self.cancel();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    /// Whether the worker thread has exited.
    pub fn is_terminated(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |h| h.is_finished())
    }

    // ── Listeners & metrics ──────────────────────────────────────────

    pub fn add_listener(&self, listener: Arc<dyn ScheduleListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ScheduleListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Get a snapshot of the current timer metrics.
    pub fn metrics(&self) -> TimerMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Internals ────────────────────────────────────────────────────

    fn time_after(&self, delay_ms: i64) -> Result<VirtualTime, SchedulerError> {
        if delay_ms < 0 {
            return Err(SchedulerError::InvalidDelay(delay_ms));
        }
        Ok(self.clock.time().saturating_add(delay_ms))
    }

    fn sched(&self, task: &Arc<Task>, time: VirtualTime, period: i64) -> Result<(), SchedulerError> {
        if time < 0 {
            return Err(SchedulerError::InvalidExecutionTime(time));
        }

        {
            let mut state = self.shared.lock();
            if !state.accepting {
                return Err(SchedulerError::SchedulerClosed);
            }

            {
                let mut slot = task.lock_slot();
                if slot.state != TaskState::Pending {
                    return Err(SchedulerError::TaskAlreadyScheduled(task.name().to_string()));
                }
                slot.state = TaskState::Scheduled;
            }

            state.queue.add(QueueEntry {
                execution_time: time,
                period,
                task: Arc::clone(task),
            });
            let is_head = state
                .queue
                .peek_min()
                .is_some_and(|head| Arc::ptr_eq(&head.task, task));
            if is_head {
                self.shared.available.notify_all();
            }
        }

        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks_scheduled += 1;
        Ok(())
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn check_period(period_ms: i64) -> Result<(), SchedulerError> {
    if period_ms <= 0 {
        return Err(SchedulerError::InvalidPeriod(period_ms));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ScaledClock;

    fn paused_timer(start: VirtualTime) -> TimerQueue {
        let clock: Arc<dyn VirtualClock> = Arc::new(ScaledClock::paused(start, 1.0));
        TimerQueue::new(clock).unwrap()
    }

    fn noop(name: &str) -> Arc<Task> {
        Task::new(name, || Ok(()))
    }

    #[test]
    fn schedule_marks_task_scheduled() {
        let timer = paused_timer(0);
        let task = noop("a");
        timer.schedule_at(&task, 10_000).unwrap();
        assert_eq!(task.state(), TaskState::Scheduled);
        assert_eq!(timer.pending(), 1);
        assert_eq!(timer.metrics().tasks_scheduled, 1);
    }

    #[test]
    fn metrics_survive_a_poisoned_lock() {
        let timer = paused_timer(0);
        let metrics = Arc::clone(&timer.metrics);
        let _ = std::thread::spawn(move || {
            let _guard = metrics.write().unwrap();
            panic!("poison metrics");
        })
        .join();
        assert!(timer.metrics.is_poisoned());

        timer.schedule_at(&noop("after-poison"), 10_000).unwrap();
        assert_eq!(timer.metrics().tasks_scheduled, 1);
    }

    #[test]
    fn rescheduling_same_task_fails() {
        let timer = paused_timer(0);
        let task = noop("twice");
        timer.schedule_at(&task, 10_000).unwrap();
        let err = timer.schedule_at(&task, 20_000).unwrap_err();
        assert!(matches!(err, SchedulerError::TaskAlreadyScheduled(ref n) if n == "twice"));
    }

    #[test]
    fn cancelled_task_cannot_be_scheduled() {
        let timer = paused_timer(0);
        let task = noop("c");
        task.cancel();
        assert!(matches!(
            timer.schedule_at(&task, 1).unwrap_err(),
            SchedulerError::TaskAlreadyScheduled(_)
        ));
    }

    #[test]
    fn negative_delay_rejected() {
        let timer = paused_timer(0);
        let err = timer.schedule_after(&noop("d"), -1).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidDelay(-1)));
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn non_positive_period_rejected() {
        let timer = paused_timer(0);
        let task = noop("p");
        for period in [0, -5] {
            assert!(matches!(
                timer.schedule_fixed_rate_at(&task, 100, period).unwrap_err(),
                SchedulerError::InvalidPeriod(_)
            ));
            assert!(matches!(
                timer.schedule_fixed_delay_after(&task, 100, period).unwrap_err(),
                SchedulerError::InvalidPeriod(_)
            ));
        }
        assert_eq!(task.state(), TaskState::Pending, "rejected calls never queue");
    }

    #[test]
    fn negative_execution_time_rejected() {
        let timer = paused_timer(0);
        let err = timer.schedule_at(&noop("n"), -10).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidExecutionTime(-10)));
    }

    #[test]
    fn schedule_after_cancel_fails() {
        let timer = paused_timer(0);
        timer.schedule_at(&noop("x"), 50_000).unwrap();
        timer.cancel();
        timer.cancel();
        assert!(timer.is_cancelled());
        assert_eq!(timer.pending(), 0);
        assert!(matches!(
            timer.schedule_at(&noop("y"), 50_000).unwrap_err(),
            SchedulerError::SchedulerClosed
        ));
        assert!(matches!(timer.purge().unwrap_err(), SchedulerError::SchedulerClosed));
    }

    #[test]
    fn purge_counts_cancelled() {
        let timer = paused_timer(0);
        let tasks: Vec<_> = (0..5).map(|i| noop(&format!("t{i}"))).collect();
        for (i, t) in tasks.iter().enumerate() {
            timer.schedule_at(t, 100_000 + i as i64).unwrap();
        }
        tasks[1].cancel();
        tasks[3].cancel();
        assert_eq!(timer.purge().unwrap(), 2);
        assert_eq!(timer.pending(), 3);
        assert_eq!(timer.metrics().tasks_purged, 2);
    }

    #[test]
    fn join_stops_worker() {
        let timer = paused_timer(0);
        timer.join();
        assert!(timer.is_terminated());
        timer.join();
    }
}
