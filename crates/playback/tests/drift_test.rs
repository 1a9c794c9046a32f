//! Backpressure scenarios: single-flight pauses and playback throttling
//! driven by a slow sink.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use histplay_core::config::DriftConfig;
use histplay_core::{Config, HistoryRecord, PublishedUpdate, UpdateId};
use histplay_playback::{
    DriftGuard, InMemoryHistoryStore, PlaybackControl, PublishError, PublishSink, RecordingSink,
    ReplayCoordinator, SimulatedPlayback,
};
use histplay_timer::ScheduleListener;

const TIMEOUT: Duration = Duration::from_secs(5);

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {TIMEOUT:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Sleeps on every live update, like a consumer that cannot keep up.
struct SlowSink {
    inner: RecordingSink,
    delay: Duration,
    live: AtomicUsize,
}

impl PublishSink for SlowSink {
    fn publish(&self, update: PublishedUpdate) -> Result<(), PublishError> {
        if matches!(update, PublishedUpdate::Live(_)) {
            thread::sleep(self.delay);
            self.live.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.publish(update)
    }
}

#[test]
fn concurrent_behind_signals_start_one_pause() {
    let playback = Arc::new(SimulatedPlayback::new(0, 1.0));
    playback.play();
    let guard = Arc::new(DriftGuard::new(playback.clone(), &DriftConfig::default()));

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let guard = guard.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                guard.behind_schedule(2_000);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(guard.pause_count(), 1);
    wait_until(|| playback.is_held());
    assert_eq!(playback.hold_count(), 1);

    guard.on_schedule();
    wait_until(|| !guard.is_pausing());
    assert!(!playback.is_held());
    assert!(playback.is_playing());

    // A new episode may start once the previous one is over.
    guard.behind_schedule(100);
    assert_eq!(guard.pause_count(), 2);
    wait_until(|| !guard.is_pausing());
}

#[test]
fn pause_freezes_the_clock_then_releases_it() {
    let playback = Arc::new(SimulatedPlayback::new(0, 1.0));
    playback.play();
    let guard = DriftGuard::new(playback.clone(), &DriftConfig::default());

    guard.behind_schedule(300);
    wait_until(|| playback.is_held());
    let frozen = playback.clock_time();
    thread::sleep(Duration::from_millis(100));
    assert!(playback.clock_time() - frozen <= 5, "clock advanced while held");

    wait_until(|| !guard.is_pausing());
    let resumed = playback.clock_time();
    thread::sleep(Duration::from_millis(50));
    assert!(playback.clock_time() > resumed);
}

#[test]
fn pause_is_capped_by_config() {
    let playback = Arc::new(SimulatedPlayback::new(0, 1.0));
    playback.play();
    let config = DriftConfig {
        enabled: true,
        max_pause_ms: 50,
    };
    let guard = DriftGuard::new(playback.clone(), &config);

    let started = Instant::now();
    guard.behind_schedule(60_000);
    wait_until(|| !guard.is_pausing());
    assert!(started.elapsed() < Duration::from_secs(2));
}

fn slow_replay(config: &Config) -> (Arc<SimulatedPlayback>, Arc<SlowSink>, Arc<ReplayCoordinator>) {
    let id = UpdateId::tag(1);
    let records = (0..3)
        .map(|i| HistoryRecord::new(id, 100 + i * 10, json!(i)))
        .collect::<Vec<_>>();
    let playback = Arc::new(SimulatedPlayback::new(0, 1.0));
    let store = Arc::new(InMemoryHistoryStore::from_records(records));
    let sink = Arc::new(SlowSink {
        inner: RecordingSink::new(),
        delay: Duration::from_millis(300),
        live: AtomicUsize::new(0),
    });
    let coordinator = ReplayCoordinator::attach(playback.clone(), store, sink.clone(), config);
    (playback, sink, coordinator)
}

#[test]
fn slow_consumer_throttles_playback() {
    let (playback, sink, coordinator) = slow_replay(&Config::default());
    playback.seek(0);
    playback.play();

    wait_until(|| sink.live.load(Ordering::SeqCst) == 3);
    assert!(coordinator.drift_guard().pause_count() >= 1);
    assert!(playback.hold_count() >= 1);
    assert!(coordinator.timer_metrics().is_some_and(|m| m.behind_schedule_episodes >= 1));

    wait_until(|| !coordinator.drift_guard().is_pausing());
    assert!(!playback.is_held());
    assert!(playback.is_playing());
}

#[test]
fn disabled_guard_never_holds_playback() {
    let mut config = Config::default();
    config.drift.enabled = false;
    let (playback, sink, coordinator) = slow_replay(&config);
    playback.seek(0);
    playback.play();

    wait_until(|| sink.live.load(Ordering::SeqCst) == 3);
    assert_eq!(coordinator.drift_guard().pause_count(), 0);
    assert_eq!(playback.hold_count(), 0);
}

#[test]
fn stop_releases_an_active_pause() {
    let (playback, _sink, coordinator) = slow_replay(&Config::default());
    playback.seek(0);
    playback.play();

    wait_until(|| coordinator.drift_guard().is_pausing());
    playback.stop();
    wait_until(|| !coordinator.drift_guard().is_pausing());
    assert!(!playback.is_held());
    assert!(!playback.is_playing());
}
