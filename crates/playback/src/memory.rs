//! In-process collaborators: a history store, a simulated player and a
//! recording sink. Used by the `history-replay` binary and by tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use histplay_core::{CoreError, HistoryRecord, PublishedUpdate, UpdateId, VirtualTime};
use histplay_timer::{ScaledClock, VirtualClock};

use crate::error::{PlaybackError, PublishError};
use crate::traits::{
    ClockTimeSetHandler, HistoryStore, PlaybackControl, PlaybackEventHandler, PublishSink,
};

// ── InMemoryHistoryStore ─────────────────────────────────────────────

#[derive(Default)]
struct StoreInner {
    /// Per-id records, kept sorted by timestamp (stable for equal timestamps).
    records: BTreeMap<UpdateId, Vec<HistoryRecord>>,
    initialized: BTreeSet<UpdateId>,
}

/// Loaded history held in memory.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a flat list of records; every id is initialized.
    pub fn from_records(records: impl IntoIterator<Item = HistoryRecord>) -> Self {
        let mut grouped: BTreeMap<UpdateId, Vec<HistoryRecord>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.id).or_default().push(record);
        }
        let store = Self::new();
        for (id, records) in grouped {
            store.load(id, records);
        }
        store
    }

    /// Read a JSON array of records.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PlaybackError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(CoreError::Io)?;
        let records: Vec<HistoryRecord> = serde_json::from_str(&content)
            .map_err(|e| CoreError::Serialize(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), records = records.len(), "loaded history file");
        Ok(Self::from_records(records))
    }

    /// Replace the history of `id` and mark it initialized.
    pub fn load(&self, id: UpdateId, mut records: Vec<HistoryRecord>) {
        records.sort_by_key(|r| r.timestamp);
        let mut inner = self.write();
        inner.records.insert(id, records);
        inner.initialized.insert(id);
    }

    /// Track `id` before its history has been loaded.
    pub fn register(&self, id: UpdateId) {
        self.write().records.entry(id).or_default();
    }

    /// Stop tracking `id`. Returns whether it was tracked.
    pub fn remove(&self, id: UpdateId) -> bool {
        let mut inner = self.write();
        inner.initialized.remove(&id);
        inner.records.remove(&id).is_some()
    }

    /// Earliest and latest timestamps over all records.
    pub fn time_range(&self) -> Option<(VirtualTime, VirtualTime)> {
        let inner = self.read();
        let mut stamps = inner.records.values().flatten().map(|r| r.timestamp);
        let first = stamps.next()?;
        Some(stamps.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t))))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn tracked_ids(&self) -> Vec<UpdateId> {
        self.read().records.keys().copied().collect()
    }

    fn records_for(&self, id: UpdateId) -> Vec<HistoryRecord> {
        self.read().records.get(&id).cloned().unwrap_or_default()
    }

    fn value_at(&self, id: UpdateId, time: VirtualTime) -> Option<HistoryRecord> {
        let inner = self.read();
        let records = inner.records.get(&id)?;
        let idx = records.partition_point(|r| r.timestamp <= time);
        idx.checked_sub(1).map(|i| records[i].clone())
    }

    fn is_initialized(&self, id: UpdateId) -> bool {
        self.read().initialized.contains(&id)
    }
}

// ── SimulatedPlayback ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PlayState {
    playing: bool,
    held: bool,
}

type Handlers<T> = RwLock<Vec<Arc<T>>>;

/// A [`PlaybackControl`] over a [`ScaledClock`].
///
/// The clock runs only while the user is playing and no synchronisation hold
/// is active.
pub struct SimulatedPlayback {
    clock: Arc<ScaledClock>,
    state: Mutex<PlayState>,
    holds: AtomicU64,
    clock_time_set: Handlers<dyn Fn(VirtualTime) + Send + Sync>,
    playback_starting: Handlers<dyn Fn() + Send + Sync>,
    stopped: Handlers<dyn Fn() + Send + Sync>,
}

impl SimulatedPlayback {
    /// A stopped player positioned at `start`.
    pub fn new(start: VirtualTime, speed: f64) -> Self {
        Self {
            clock: Arc::new(ScaledClock::paused(start, speed)),
            state: Mutex::new(PlayState::default()),
            holds: AtomicU64::new(0),
            clock_time_set: RwLock::new(Vec::new()),
            playback_starting: RwLock::new(Vec::new()),
            stopped: RwLock::new(Vec::new()),
        }
    }

    pub fn clock(&self) -> &Arc<ScaledClock> {
        &self.clock
    }

    /// Start playback. Starting handlers run before the clock moves.
    pub fn play(&self) {
        if self.lock().playing {
            return;
        }
        for handler in snapshot(&self.playback_starting) {
            handler();
        }
        let mut state = self.lock();
        state.playing = true;
        self.sync_clock(&state);
    }

    pub fn stop(&self) {
        {
            let mut state = self.lock();
            if !state.playing {
                return;
            }
            state.playing = false;
            self.sync_clock(&state);
        }
        for handler in snapshot(&self.stopped) {
            handler();
        }
    }

    /// Move the clock to `time` and notify clock-time handlers.
    pub fn seek(&self, time: VirtualTime) {
        self.clock.seek(time);
        for handler in snapshot(&self.clock_time_set) {
            handler(time);
        }
    }

    pub fn set_speed(&self, speed: f64) {
        self.clock.set_speed(speed);
    }

    /// Whether a synchronisation hold is active.
    pub fn is_held(&self) -> bool {
        self.lock().held
    }

    /// Number of holds applied so far.
    pub fn hold_count(&self) -> u64 {
        self.holds.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, PlayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_clock(&self, state: &PlayState) {
        if state.playing && !state.held {
            self.clock.resume();
        } else {
            self.clock.pause();
        }
    }
}

fn snapshot<T: ?Sized>(handlers: &Handlers<T>) -> Vec<Arc<T>> {
    handlers.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn register<T: ?Sized>(handlers: &Handlers<T>, handler: Arc<T>) {
    handlers
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(handler);
}

impl PlaybackControl for SimulatedPlayback {
    fn is_playing(&self) -> bool {
        self.lock().playing
    }

    fn speed(&self) -> f64 {
        self.clock.speed()
    }

    fn clock_time(&self) -> VirtualTime {
        self.clock.time()
    }

    fn pause(&self) {
        let mut state = self.lock();
        if !state.held {
            state.held = true;
            self.holds.fetch_add(1, Ordering::Relaxed);
            self.sync_clock(&state);
        }
    }

    fn resume(&self) {
        let mut state = self.lock();
        if state.held {
            state.held = false;
            self.sync_clock(&state);
        }
    }

    fn on_clock_time_set(&self, handler: ClockTimeSetHandler) {
        register(&self.clock_time_set, Arc::from(handler));
    }

    fn on_playback_starting(&self, handler: PlaybackEventHandler) {
        register(&self.playback_starting, Arc::from(handler));
    }

    fn on_stopped(&self, handler: PlaybackEventHandler) {
        register(&self.stopped, Arc::from(handler));
    }
}

// ── RecordingSink ────────────────────────────────────────────────────

/// Collects every published update. Publishing for ids marked with
/// [`fail_on`](Self::fail_on) is rejected instead.
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<PublishedUpdate>>,
    arrived: Condvar,
    failing: RwLock<HashSet<UpdateId>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every later update for `id`.
    pub fn fail_on(&self, id: UpdateId) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn updates(&self) -> Vec<PublishedUpdate> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Block until at least `count` updates were recorded or `timeout` passed.
    /// Returns whether the count was reached.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut updates = self.lock();
        while updates.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            updates = self
                .arrived
                .wait_timeout(updates, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PublishedUpdate>> {
        self.updates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PublishSink for RecordingSink {
    fn publish(&self, update: PublishedUpdate) -> Result<(), PublishError> {
        let id = update.id();
        if self
            .failing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
        {
            return Err(PublishError::Rejected {
                id,
                message: "marked as failing".into(),
            });
        }
        self.lock().push(update);
        self.arrived.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    fn rec(id: UpdateId, ts: VirtualTime) -> HistoryRecord {
        HistoryRecord::new(id, ts, json!(ts))
    }

    #[test]
    fn value_at_is_latest_not_after() {
        let id = UpdateId::tag(1);
        let store = InMemoryHistoryStore::from_records(vec![rec(id, 9_000), rec(id, 5_000)]);

        assert_eq!(store.value_at(id, 4_999), None);
        assert_eq!(store.value_at(id, 5_000).unwrap().timestamp, 5_000);
        assert_eq!(store.value_at(id, 7_000).unwrap().timestamp, 5_000);
        assert_eq!(store.value_at(id, 9_500).unwrap().timestamp, 9_000);
        assert_eq!(store.value_at(UpdateId::tag(2), 9_500), None);
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let id = UpdateId::tag(1);
        let first = HistoryRecord::new(id, 100, json!("first"));
        let second = HistoryRecord::new(id, 100, json!("second"));
        let store = InMemoryHistoryStore::from_records(vec![first, second, rec(id, 50)]);

        let values: Vec<_> = store.records_for(id).into_iter().map(|r| r.value).collect();
        assert_eq!(values, vec![json!(50), json!("first"), json!("second")]);
        assert_eq!(store.value_at(id, 100).unwrap().value, json!("second"));
    }

    #[test]
    fn registered_ids_are_uninitialized() {
        let store = InMemoryHistoryStore::new();
        store.register(UpdateId::supervision(3));
        assert_eq!(store.tracked_ids(), vec![UpdateId::supervision(3)]);
        assert!(!store.is_initialized(UpdateId::supervision(3)));

        store.load(UpdateId::supervision(3), vec![]);
        assert!(store.is_initialized(UpdateId::supervision(3)));
        assert!(store.remove(UpdateId::supervision(3)));
        assert!(store.tracked_ids().is_empty());
    }

    #[test]
    fn time_range_spans_all_ids() {
        let store = InMemoryHistoryStore::from_records(vec![
            rec(UpdateId::tag(1), 300),
            rec(UpdateId::tag(2), 100),
            rec(UpdateId::tag(2), 700),
        ]);
        assert_eq!(store.time_range(), Some((100, 700)));
        assert_eq!(InMemoryHistoryStore::new().time_range(), None);
    }

    #[test]
    fn loads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":{{"tag_id":1,"kind":"TagValue"}},"timestamp":1000,"value":42}},
               {{"id":{{"tag_id":1,"kind":"Supervision"}},"timestamp":500,"value":"DOWN"}}]"#
        )
        .unwrap();

        let store = InMemoryHistoryStore::from_json_file(file.path()).unwrap();
        assert_eq!(store.tracked_ids().len(), 2);
        assert_eq!(store.value_at(UpdateId::tag(1), 1_000).unwrap().value, json!(42));
    }

    #[test]
    fn bad_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = InMemoryHistoryStore::from_json_file(file.path()).err().unwrap();
        assert!(matches!(err, PlaybackError::Core(CoreError::Serialize(_))));
    }

    #[test]
    fn playback_clock_runs_only_when_playing_and_not_held() {
        let playback = SimulatedPlayback::new(1_000, 1.0);
        assert!(!playback.clock().is_running());

        playback.play();
        assert!(playback.is_playing());
        assert!(playback.clock().is_running());

        playback.pause();
        assert!(playback.is_held());
        assert!(playback.is_playing(), "a hold is not a user stop");
        assert!(!playback.clock().is_running());

        playback.resume();
        assert!(playback.clock().is_running());
        assert_eq!(playback.hold_count(), 1);

        playback.stop();
        playback.resume();
        assert!(!playback.clock().is_running());
    }

    #[test]
    fn handlers_fire_on_transitions() {
        let playback = SimulatedPlayback::new(0, 1.0);
        let starting = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let seeks = Arc::new(Mutex::new(Vec::new()));

        let s = starting.clone();
        playback.on_playback_starting(Box::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        let s = stopped.clone();
        playback.on_stopped(Box::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        let s = seeks.clone();
        playback.on_clock_time_set(Box::new(move |t: VirtualTime| s.lock().unwrap().push(t)));

        playback.play();
        playback.play();
        playback.seek(4_000);
        playback.stop();
        playback.stop();

        assert_eq!(starting.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(*seeks.lock().unwrap(), vec![4_000]);
        assert!(playback.clock_time() >= 4_000);
    }

    #[test]
    fn sink_records_and_rejects() {
        let sink = RecordingSink::new();
        sink.fail_on(UpdateId::tag(2));

        sink.publish(PublishedUpdate::Live(rec(UpdateId::tag(1), 10))).unwrap();
        let err = sink
            .publish(PublishedUpdate::Live(rec(UpdateId::tag(2), 10)))
            .unwrap_err();
        assert!(matches!(err, PublishError::Rejected { .. }));

        assert_eq!(sink.len(), 1);
        assert!(sink.wait_for(1, Duration::from_millis(10)));
        assert!(!sink.wait_for(2, Duration::from_millis(10)));
    }
}
