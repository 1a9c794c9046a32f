use std::sync::Arc;

use histplay_core::VirtualTime;
use histplay_timer::VirtualClock;

use crate::traits::PlaybackControl;

/// Exposes a [`PlaybackControl`]'s clock to the timer.
///
/// The behind-schedule threshold is configured in real milliseconds and
/// scaled by the current playback speed.
pub struct PlaybackClock {
    control: Arc<dyn PlaybackControl>,
    behind_schedule_threshold_ms: i64,
}

impl PlaybackClock {
    pub fn new(control: Arc<dyn PlaybackControl>, behind_schedule_threshold_ms: i64) -> Self {
        Self {
            control,
            behind_schedule_threshold_ms,
        }
    }
}

impl VirtualClock for PlaybackClock {
    fn time(&self) -> VirtualTime {
        self.control.clock_time()
    }

    fn speed_multiplier(&self) -> f64 {
        self.control.speed()
    }

    fn lag_threshold(&self) -> i64 {
        (self.behind_schedule_threshold_ms as f64 * self.control.speed()) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimulatedPlayback;

    #[test]
    fn follows_control() {
        let playback = Arc::new(SimulatedPlayback::new(12_000, 4.0));
        let clock = PlaybackClock::new(playback.clone(), 200);

        assert_eq!(clock.time(), 12_000);
        assert_eq!(clock.speed_multiplier(), 4.0);
        assert_eq!(clock.lag_threshold(), 800);

        playback.set_speed(0.5);
        playback.seek(20_000);
        assert_eq!(clock.time(), 20_000);
        assert_eq!(clock.lag_threshold(), 100);
    }
}
