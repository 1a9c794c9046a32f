//! Virtual-time timer queue with drift reporting.
//!
//! A [`TimerQueue`] owns one background worker thread and a min-heap of
//! [`Task`]s keyed by virtual execution time. The worker reads "now" from an
//! injected [`VirtualClock`], so playback speed changes and seeks are honoured
//! without rescheduling. When the worker falls behind the clock it notifies
//! registered [`ScheduleListener`]s, which is how playback applies backpressure.
//!
//! Split into focused modules:
//! - `task`: schedulable unit of work and its lifecycle state
//! - `queue`: binary min-heap of scheduled tasks
//! - `clock`: the virtual clock seam plus wall-clock and scaled implementations
//! - `listener`: behind/on-schedule notification registry
//! - `worker`: the background firing loop
//! - `timer`: public scheduling facade

pub mod clock;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod queue;
pub mod task;
pub mod timer;
mod worker;

pub use clock::{ScaledClock, SystemClock, VirtualClock};
pub use error::SchedulerError;
pub use listener::{ListenerRegistry, ScheduleListener};
pub use metrics::TimerMetrics;
pub use queue::{QueueEntry, TaskQueue};
pub use task::{Task, TaskError, TaskState};
pub use timer::TimerQueue;
