use thiserror::Error;

use histplay_core::{CoreError, UpdateId};
use histplay_timer::SchedulerError;

/// Errors a [`PublishSink`](crate::PublishSink) may report.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("sink rejected update for {id}: {message}")]
    Rejected { id: UpdateId, message: String },

    #[error("failed to encode update: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by playback setup.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
