use std::time::Duration;

use serde::Serialize;

use histplay_core::VirtualTime;

/// Operational counters for one timer queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimerMetrics {
    /// Successful submissions.
    pub tasks_scheduled: u64,
    /// Callback invocations that returned `Ok`.
    pub tasks_fired: u64,
    /// Callback invocations that returned `Err` or panicked.
    pub callback_failures: u64,
    /// Cancelled entries removed by `purge`.
    pub tasks_purged: u64,
    /// Number of times the worker went from on-schedule to behind.
    pub behind_schedule_episodes: u64,
    /// Largest lag observed when a task fired, in virtual ms.
    pub max_lag_ms: i64,
    /// Virtual execution time of the most recently fired task.
    pub last_fired_at: Option<VirtualTime>,
    /// Mean real duration of callbacks.
    pub avg_callback_duration: Duration,
}

impl TimerMetrics {
    /// Record a callback invocation, successful or not.
    pub fn record_execution(&mut self, execution_time: VirtualTime, lag_ms: i64, duration: Duration, ok: bool) {
        if ok {
            self.tasks_fired += 1;
        } else {
            self.callback_failures += 1;
        }
        self.last_fired_at = Some(execution_time);
        self.max_lag_ms = self.max_lag_ms.max(lag_ms);

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.tasks_fired + self.callback_failures;
        self.avg_callback_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_callback_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = TimerMetrics::default();
        m.record_execution(1_000, 5, Duration::from_millis(100), true);

        assert_eq!(m.tasks_fired, 1);
        assert_eq!(m.last_fired_at, Some(1_000));
        assert_eq!(m.max_lag_ms, 5);
        assert_eq!(m.avg_callback_duration, Duration::from_millis(100));
    }

    #[test]
    fn failures_count_towards_average() {
        let mut m = TimerMetrics::default();
        m.record_execution(1, 0, Duration::from_millis(100), true);
        m.record_execution(2, 40, Duration::from_millis(200), false);

        assert_eq!(m.tasks_fired, 1);
        assert_eq!(m.callback_failures, 1);
        assert_eq!(m.max_lag_ms, 40);
        let avg = m.avg_callback_duration.as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn default_metrics() {
        let m = TimerMetrics::default();
        assert_eq!(m.tasks_fired, 0);
        assert_eq!(m.last_fired_at, None);
        assert_eq!(m.avg_callback_duration, Duration::ZERO);
    }
}
