//! Historical playback on top of the virtual-time timer.
//!
//! A [`ReplayCoordinator`] republishes recorded updates to a [`PublishSink`]
//! as the playback clock reaches them, and a [`DriftGuard`] holds the clock
//! whenever the timer falls behind.

pub mod clock;
pub mod coordinator;
pub mod drift_guard;
pub mod error;
pub mod memory;
pub mod traits;

pub use clock::PlaybackClock;
pub use coordinator::{next_execution_time, ReplayCoordinator};
pub use drift_guard::DriftGuard;
pub use error::{PlaybackError, PublishError};
pub use memory::{InMemoryHistoryStore, RecordingSink, SimulatedPlayback};
pub use traits::{
    BatchUpdateListener, ClockTimeSetHandler, HistoryStore, PlaybackControl, PlaybackEventHandler,
    PublishSink,
};
