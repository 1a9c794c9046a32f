use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::warn;

use histplay_core::VirtualTime;

/// Source of "now" for a [`TimerQueue`](crate::TimerQueue).
///
/// The timer only reads from the clock; seeking, pausing and speed changes
/// belong to whoever owns the implementation.
pub trait VirtualClock: Send + Sync {
    /// Current virtual instant.
    fn time(&self) -> VirtualTime;

    /// Virtual milliseconds per real millisecond. `1.0` is real time.
    fn speed_multiplier(&self) -> f64;

    /// Lag (virtual ms) beyond which the timer reports itself behind schedule.
    fn lag_threshold(&self) -> i64;
}

/// Blanket implementation so `Arc<dyn VirtualClock>` can be used directly.
impl<T: VirtualClock + ?Sized> VirtualClock for Arc<T> {
    fn time(&self) -> VirtualTime {
        (**self).time()
    }

    fn speed_multiplier(&self) -> f64 {
        (**self).speed_multiplier()
    }

    fn lag_threshold(&self) -> i64 {
        (**self).lag_threshold()
    }
}

// ── Wall clock ───────────────────────────────────────────────────────

/// Real time at speed 1.
#[derive(Debug, Clone)]
pub struct SystemClock {
    lag_threshold_ms: i64,
}

impl SystemClock {
    pub fn new(lag_threshold_ms: i64) -> Self {
        Self { lag_threshold_ms }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(200)
    }
}

impl VirtualClock for SystemClock {
    fn time(&self) -> VirtualTime {
        Utc::now().timestamp_millis()
    }

    fn speed_multiplier(&self) -> f64 {
        1.0
    }

    fn lag_threshold(&self) -> i64 {
        self.lag_threshold_ms
    }
}

// ── Scaled clock ─────────────────────────────────────────────────────

#[derive(Debug)]
struct ScaledState {
    /// Virtual time at `anchor_real`.
    anchor_virtual: VirtualTime,
    anchor_real: Instant,
    speed: f64,
    running: bool,
}

impl ScaledState {
    fn now(&self) -> VirtualTime {
        if !self.running {
            return self.anchor_virtual;
        }
        let elapsed_ms = self.anchor_real.elapsed().as_secs_f64() * 1000.0;
        self.anchor_virtual + (elapsed_ms * self.speed) as i64
    }

    /// Fold elapsed time into the anchor so later changes start from "now".
    fn reanchor(&mut self) {
        self.anchor_virtual = self.now();
        self.anchor_real = Instant::now();
    }
}

/// Virtual clock advancing at `speed` times real time from a seekable anchor.
///
/// The lag threshold is given in real milliseconds and reported scaled by the
/// current speed, so "behind schedule" means the same wall-clock lag at any speed.
#[derive(Debug)]
pub struct ScaledClock {
    state: Mutex<ScaledState>,
    lag_threshold_ms: i64,
}

impl ScaledClock {
    /// A running clock starting at `start`.
    pub fn new(start: VirtualTime, speed: f64) -> Self {
        Self {
            state: Mutex::new(ScaledState {
                anchor_virtual: start,
                anchor_real: Instant::now(),
                speed: sanitize_speed(speed).unwrap_or(1.0),
                running: true,
            }),
            lag_threshold_ms: 200,
        }
    }

    /// A stopped clock parked at `start`.
    pub fn paused(start: VirtualTime, speed: f64) -> Self {
        let clock = Self::new(start, speed);
        clock.lock().running = false;
        clock
    }

    pub fn with_lag_threshold(mut self, lag_threshold_ms: i64) -> Self {
        self.lag_threshold_ms = lag_threshold_ms;
        self
    }

    pub fn speed(&self) -> f64 {
        self.lock().speed
    }

    /// Change the speed without jumping: virtual time keeps its current value.
    /// Non-finite or non-positive speeds are ignored.
    pub fn set_speed(&self, speed: f64) {
        let Some(speed) = sanitize_speed(speed) else {
            warn!(speed, "ignoring invalid clock speed");
            return;
        };
        let mut state = self.lock();
        state.reanchor();
        state.speed = speed;
    }

    /// Jump to `time`. Running state is kept.
    pub fn seek(&self, time: VirtualTime) {
        let mut state = self.lock();
        state.anchor_virtual = time;
        state.anchor_real = Instant::now();
    }

    pub fn pause(&self) {
        let mut state = self.lock();
        if state.running {
            state.reanchor();
            state.running = false;
        }
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        if !state.running {
            state.anchor_real = Instant::now();
            state.running = true;
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    fn lock(&self) -> MutexGuard<'_, ScaledState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sanitize_speed(speed: f64) -> Option<f64> {
    (speed.is_finite() && speed > 0.0).then_some(speed)
}

impl VirtualClock for ScaledClock {
    fn time(&self) -> VirtualTime {
        self.lock().now()
    }

    fn speed_multiplier(&self) -> f64 {
        self.lock().speed
    }

    fn lag_threshold(&self) -> i64 {
        (self.lag_threshold_ms as f64 * self.speed()) as i64
    }
}
