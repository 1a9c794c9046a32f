use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use histplay_core::VirtualTime;

/// Error type for a task callback.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),
}

/// Lifecycle of a [`Task`]. Only `Pending` tasks can be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never submitted.
    Pending,
    /// Sitting in a queue (one-shot not yet fired, or periodic).
    Scheduled,
    /// One-shot task that has fired.
    Executed,
    /// Cancelled before it could fire (again).
    Cancelled,
}

pub type TaskCallback = Box<dyn FnMut() -> Result<(), TaskError> + Send>;

pub(crate) struct TaskSlot {
    pub(crate) state: TaskState,
    pub(crate) last_execution_time: Option<VirtualTime>,
}

/// A unit of work fired by a [`TimerQueue`](crate::TimerQueue).
///
/// The state lives behind its own mutex, separate from the queue lock, so
/// [`cancel`](Task::cancel) never contends with the worker's queue operations.
/// Lock order is always queue first, then task.
pub struct Task {
    name: String,
    slot: Mutex<TaskSlot>,
    callback: Mutex<TaskCallback>,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Arc<Self>
    where
        F: FnMut() -> Result<(), TaskError> + Send + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            slot: Mutex::new(TaskSlot {
                state: TaskState::Pending,
                last_execution_time: None,
            }),
            callback: Mutex::new(Box::new(callback)),
        })
    }

    /// Human-readable name for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.lock_slot().state
    }

    /// Cancel the task. Returns `true` if this prevented a future execution,
    /// i.e. the task was scheduled and had not yet retired.
    ///
    /// The entry stays in its queue until the worker reaches it or
    /// [`purge`](crate::TimerQueue::purge) sweeps it.
    pub fn cancel(&self) -> bool {
        let mut slot = self.lock_slot();
        let prevented = slot.state == TaskState::Scheduled;
        slot.state = TaskState::Cancelled;
        prevented
    }

    /// Virtual time of the most recent firing, if any.
    pub fn scheduled_execution_time(&self) -> Option<VirtualTime> {
        self.lock_slot().last_execution_time
    }

    pub(crate) fn lock_slot(&self) -> MutexGuard<'_, TaskSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn run(&self) -> Result<(), TaskError> {
        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        (*callback)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
