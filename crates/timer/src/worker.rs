use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use histplay_core::config::TimerConfig;
use histplay_core::{VirtualTime, format_virtual_time};

use crate::clock::VirtualClock;
use crate::error::SchedulerError;
use crate::listener::ListenerRegistry;
use crate::metrics::TimerMetrics;
use crate::queue::TaskQueue;
use crate::task::{Task, TaskState};

/// Queue plus the "may still accept tasks" flag, guarded together.
pub(crate) struct QueueState {
    pub(crate) queue: TaskQueue,
    pub(crate) accepting: bool,
}

/// State shared between a [`TimerQueue`](crate::TimerQueue) and its worker.
pub(crate) struct Shared {
    state: Mutex<QueueState>,
    pub(crate) available: Condvar,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: TaskQueue::new(),
                accepting: true,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting tasks, drop the pending ones and wake the worker.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.accepting = false;
        state.queue.clear();
        self.available.notify_all();
    }
}

/// Closes the queue when the worker leaves its loop, including by unwinding.
struct CloseOnExit<'a>(&'a Shared);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Outcome of one pass over the queue head.
struct Step {
    fired: Option<Arc<Task>>,
    execution_time: VirtualTime,
    lag: i64,
}

/// The single background loop behind a [`TimerQueue`](crate::TimerQueue).
pub(crate) struct TimerWorker {
    pub(crate) name: String,
    pub(crate) shared: Arc<Shared>,
    pub(crate) clock: Arc<dyn VirtualClock>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) metrics: Arc<RwLock<TimerMetrics>>,
    max_wait: Duration,
    on_schedule_threshold: i64,
    /// A "behind schedule" went out and the matching "on schedule" is owed.
    behind: bool,
}

impl TimerWorker {
    pub(crate) fn new(
        name: String,
        shared: Arc<Shared>,
        clock: Arc<dyn VirtualClock>,
        listeners: Arc<ListenerRegistry>,
        metrics: Arc<RwLock<TimerMetrics>>,
        config: &TimerConfig,
    ) -> Self {
        Self {
            name,
            shared,
            clock,
            listeners,
            metrics,
            max_wait: Duration::from_millis(config.max_wait_ms.max(1)),
            on_schedule_threshold: config.on_schedule_threshold_ms,
            behind: false,
        }
    }

    /// Run until the queue is closed and empty.
    pub(crate) fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let _close = CloseOnExit(&shared);
        debug!(timer = %self.name, "timer worker started");

        while let Some(step) = self.next_step() {
            self.report_drift(step.lag);
            if let Some(task) = step.fired {
                self.execute(&task, step.execution_time, step.lag);
            }
        }

        info!(timer = %self.name, "timer worker stopped");
    }

    /// Wait for the queue head and fire, reschedule or sleep on it.
    /// Returns `None` once the queue is permanently empty.
    fn next_step(&self) -> Option<Step> {
        let mut state = self.shared.lock();
        loop {
            while state.queue.is_empty() && state.accepting {
                state = self
                    .shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            let (execution_time, period, task) = {
                let head = state.queue.peek_min()?;
                (head.execution_time, head.period, Arc::clone(&head.task))
            };

            let mut slot = task.lock_slot();
            if slot.state == TaskState::Cancelled {
                drop(slot);
                state.queue.remove_min();
                continue;
            }

            let current = self.clock.time();
            let lag = current - execution_time;
            let fired = lag >= 0;
            if fired {
                slot.last_execution_time = Some(execution_time);
                if period == 0 {
                    state.queue.remove_min();
                    slot.state = TaskState::Executed;
                } else if period < 0 {
                    state.queue.reschedule_min(current - period);
                } else {
                    state.queue.reschedule_min(execution_time + period);
                }
            }
            drop(slot);

            if fired {
                return Some(Step { fired: Some(task), execution_time, lag });
            }

            let wait = self.wait_time(execution_time - current);
            // Woken early by a new head, a cancel, or a spurious wakeup: all re-check.
            let _ = self
                .shared
                .available
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner);
            return Some(Step { fired: None, execution_time, lag });
        }
    }

    /// Real time to sleep for `ahead_ms` of virtual time at the current speed,
    /// clamped to `[1ms, max_wait]` so speed changes are picked up promptly.
    fn wait_time(&self, ahead_ms: i64) -> Duration {
        let speed = self.clock.speed_multiplier();
        if !(speed.is_finite() && speed > 0.0) {
            return self.max_wait;
        }
        let real_ms = (ahead_ms as f64 / speed) as u64;
        Duration::from_millis(real_ms.max(1)).min(self.max_wait)
    }

    fn report_drift(&mut self, lag: i64) {
        if lag > self.clock.lag_threshold() {
            if !self.behind {
                self.metrics
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .behind_schedule_episodes += 1;
                debug!(timer = %self.name, lag_ms = lag, "timer behind schedule");
            }
            self.behind = true;
            self.listeners.fire_behind_schedule(lag);
        } else if self.behind && lag <= self.on_schedule_threshold {
            self.behind = false;
            debug!(timer = %self.name, lag_ms = lag, "timer back on schedule");
            self.listeners.fire_on_schedule();
        }
    }

    /// Run a fired task's callback with no locks held. Failures are logged
    /// and counted; the loop keeps going.
    fn execute(&self, task: &Task, execution_time: VirtualTime, lag: i64) {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
        let elapsed = started.elapsed();

        let ok = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                let failure = SchedulerError::CallbackFailure {
                    task: task.name().to_string(),
                    message: e.to_string(),
                };
                warn!(
                    timer = %self.name,
                    at = %format_virtual_time(execution_time),
                    error = %failure,
                    "task callback failed"
                );
                false
            }
            Err(payload) => {
                let failure = SchedulerError::CallbackFailure {
                    task: task.name().to_string(),
                    message: panic_message(payload.as_ref()),
                };
                error!(timer = %self.name, error = %failure, "task callback panicked");
                false
            }
        };

        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_execution(execution_time, lag, elapsed, ok);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
