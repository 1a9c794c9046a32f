//! Backpressure for playback.
//!
//! When the timer reports that it is behind its virtual clock, the guard holds
//! the playback clock for roughly as long as the timer needs to catch up.
//! Only one hold is ever in flight; catching up or the user stopping playback
//! cuts it short, and playback is always released when the hold ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use histplay_core::config::DriftConfig;
use histplay_timer::ScheduleListener;

use crate::traits::PlaybackControl;

/// Cooperative cancellation for one pause.
#[derive(Default)]
struct PauseHandle {
    interrupted: Mutex<bool>,
    wake: Condvar,
}

impl PauseHandle {
    /// Sleep up to `duration`. Returns `true` if woken by [`interrupt`](Self::interrupt).
    fn sleep(&self, duration: Duration) -> bool {
        let guard = self.interrupted.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |interrupted| !*interrupted)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    fn interrupt(&self) {
        *self.interrupted.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }
}

struct GuardState {
    control: Arc<dyn PlaybackControl>,
    config: DriftConfig,
    active: RwLock<Option<Arc<PauseHandle>>>,
    pauses: AtomicU64,
}

impl GuardState {
    fn clear(&self, handle: &Arc<PauseHandle>) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|h| Arc::ptr_eq(h, handle)) {
            *active = None;
        }
    }
}

/// Releases playback and clears the active pause however the pause ends.
struct ResumeOnExit {
    state: Arc<GuardState>,
    handle: Arc<PauseHandle>,
}

impl Drop for ResumeOnExit {
    fn drop(&mut self) {
        self.state.control.resume();
        self.state.clear(&self.handle);
    }
}

/// Throttles the playback clock while the timer is behind schedule.
///
/// Register it with each [`TimerQueue`](histplay_timer::TimerQueue) that
/// drives playback; it reacts to `behind_schedule` and `on_schedule`.
pub struct DriftGuard {
    state: Arc<GuardState>,
}

impl DriftGuard {
    pub fn new(control: Arc<dyn PlaybackControl>, config: &DriftConfig) -> Self {
        Self {
            state: Arc::new(GuardState {
                control,
                config: config.clone(),
                active: RwLock::new(None),
                pauses: AtomicU64::new(0),
            }),
        }
    }

    /// Interrupt any pause when the user stops playback.
    pub fn watch_stopped(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.state.control.on_stopped(Box::new(move || {
            if let Some(guard) = weak.upgrade() {
                guard.playback_stopped();
            }
        }));
    }

    /// Whether a pause is currently holding playback.
    pub fn is_pausing(&self) -> bool {
        self.state
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of pauses started so far.
    pub fn pause_count(&self) -> u64 {
        self.state.pauses.load(Ordering::Relaxed)
    }

    pub fn playback_stopped(&self) {
        self.interrupt("playback stopped");
    }

    fn start_pause(&self, lag_ms: i64) {
        if !self.state.config.enabled || lag_ms <= 0 || self.is_pausing() {
            return;
        }

        let sleep = self.sleep_for(lag_ms);
        if sleep.is_zero() {
            return;
        }

        let handle = {
            let mut active = self.state.active.write().unwrap_or_else(PoisonError::into_inner);
            if active.is_some() {
                return;
            }
            let handle = Arc::new(PauseHandle::default());
            *active = Some(Arc::clone(&handle));
            handle
        };
        let n = self.state.pauses.fetch_add(1, Ordering::Relaxed) + 1;
        info!(lag_ms, sleep_ms = sleep.as_millis() as u64, pause = n, "playback behind schedule, pausing");

        let state = Arc::clone(&self.state);
        let pause_handle = Arc::clone(&handle);
        let spawned = thread::Builder::new()
            .name("drift-guard".into())
            .spawn(move || {
                let _resume = ResumeOnExit {
                    state: Arc::clone(&state),
                    handle: Arc::clone(&pause_handle),
                };
                state.control.pause();
                if pause_handle.sleep(sleep) {
                    debug!("drift pause interrupted");
                }
            });

        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn drift guard thread");
            self.state.clear(&handle);
        }
    }

    /// Real time to hold playback: the virtual lag at the current speed,
    /// capped by `max_pause_ms`.
    fn sleep_for(&self, lag_ms: i64) -> Duration {
        let speed = self.state.control.speed();
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        let ms = ((lag_ms as f64 / speed) as u64).min(self.state.config.max_pause_ms);
        Duration::from_millis(ms)
    }

    fn interrupt(&self, cause: &str) {
        let active = self
            .state
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handle) = active {
            debug!(cause, "interrupting drift pause");
            handle.interrupt();
        }
    }
}

impl ScheduleListener for DriftGuard {
    fn behind_schedule(&self, lag_ms: i64) {
        self.start_pause(lag_ms);
    }

    fn on_schedule(&self) {
        self.interrupt("back on schedule");
    }
}

impl std::fmt::Debug for DriftGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftGuard")
            .field("enabled", &self.state.config.enabled)
            .field("pausing", &self.is_pausing())
            .field("pauses", &self.pause_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::memory::SimulatedPlayback;

    fn guard(playback: &Arc<SimulatedPlayback>, max_pause_ms: u64) -> DriftGuard {
        let config = DriftConfig {
            enabled: true,
            max_pause_ms,
        };
        DriftGuard::new(playback.clone(), &config)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn handle_sleep_times_out() {
        let handle = PauseHandle::default();
        let started = Instant::now();
        assert!(!handle.sleep(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn handle_interrupt_before_sleep_returns_immediately() {
        let handle = PauseHandle::default();
        handle.interrupt();
        let started = Instant::now();
        assert!(handle.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sleep_scales_with_speed_and_is_capped() {
        let playback = Arc::new(SimulatedPlayback::new(0, 4.0));
        let g = guard(&playback, 1_000);
        assert_eq!(g.sleep_for(400), Duration::from_millis(100));
        assert_eq!(g.sleep_for(40_000), Duration::from_millis(1_000));
    }

    #[test]
    fn pause_holds_then_releases_playback() {
        let playback = Arc::new(SimulatedPlayback::new(0, 1.0));
        playback.play();
        let g = guard(&playback, 10_000);

        g.behind_schedule(200);
        assert!(g.is_pausing());
        wait_until(|| playback.is_held());
        wait_until(|| !g.is_pausing());
        assert!(!playback.is_held());
        assert!(playback.is_playing());
        assert_eq!(g.pause_count(), 1);
    }

    #[test]
    fn disabled_guard_ignores_drift() {
        let playback = Arc::new(SimulatedPlayback::new(0, 1.0));
        let config = DriftConfig {
            enabled: false,
            max_pause_ms: 10_000,
        };
        let g = DriftGuard::new(playback.clone(), &config);
        g.behind_schedule(5_000);
        assert!(!g.is_pausing());
        assert_eq!(g.pause_count(), 0);
    }

    #[test]
    fn stop_interrupts_pause() {
        let playback = Arc::new(SimulatedPlayback::new(0, 1.0));
        let g = Arc::new(guard(&playback, 60_000));
        g.watch_stopped();
        playback.play();

        g.behind_schedule(30_000);
        wait_until(|| playback.is_held());
        playback.stop();
        wait_until(|| !g.is_pausing());
        assert!(!playback.is_held());
        assert!(!playback.is_playing());
    }
}
