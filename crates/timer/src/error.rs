use thiserror::Error;

use histplay_core::VirtualTime;

/// Errors returned by [`TimerQueue`](crate::TimerQueue) scheduling calls.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("negative delay: {0}ms")]
    InvalidDelay(i64),

    #[error("non-positive period: {0}ms")]
    InvalidPeriod(i64),

    #[error("illegal execution time: {0}")]
    InvalidExecutionTime(VirtualTime),

    #[error("task '{0}' already scheduled or cancelled")]
    TaskAlreadyScheduled(String),

    #[error("timer already cancelled")]
    SchedulerClosed,

    #[error("task '{task}' callback failed: {message}")]
    CallbackFailure { task: String, message: String },

    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SchedulerError {
    /// Whether the call was rejected for a bad delay, period or execution time.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidDelay(_)
                | SchedulerError::InvalidPeriod(_)
                | SchedulerError::InvalidExecutionTime(_)
        )
    }
}
