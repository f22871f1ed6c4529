//! Error types for the Weave runtime.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use weave_channel::ChannelError;

use crate::scheduler::EntryId;

/// Errors raised synchronously by runtime operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// The engine has been shut down.
    #[error("runtime has been shut down")]
    Shutdown,

    /// The task ceiling is reached; the spawn was rejected.
    #[error("maximum number of tasks reached ({limit})")]
    TaskLimit { limit: usize },

    /// The OS refused to start a thread.
    #[error("failed to spawn task: {0}")]
    SpawnFailed(String),

    /// Outstanding tasks did not finish within the join ceiling.
    #[error("timeout waiting for tasks after {0:?}")]
    WaitTimeout(Duration),

    /// Channel operation error.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Scheduler operation error.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Structural errors of the scheduler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    /// The cron expression could not be parsed.
    #[error("invalid cron schedule {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// A delay or period is negative, not finite, or zero for an interval.
    #[error("invalid delay: {0} seconds")]
    InvalidDelay(f64),

    /// No live entry of this kind has the given id.
    #[error("no {kind} with id {id}")]
    UnknownEntry { kind: Trigger, id: EntryId },
}

/// What started an isolated execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// A spawned task.
    Task,
    /// A one-shot timer.
    Timeout,
    /// A repeating interval.
    Interval,
    /// A cron entry.
    Cron,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::Task => "task",
            Trigger::Timeout => "timeout",
            Trigger::Interval => "interval",
            Trigger::Cron => "cron",
        };
        f.write_str(name)
    }
}

/// A failure inside an isolated execution.
///
/// Never returned to a caller; delivered to the [`ErrorSink`](crate::sink::ErrorSink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    trigger: Trigger,
    id: u64,
    message: String,
    panicked: bool,
}

impl TaskFailure {
    /// A callback returned an error.
    pub fn error(trigger: Trigger, id: u64, message: impl Into<String>) -> Self {
        Self {
            trigger,
            id,
            message: message.into(),
            panicked: false,
        }
    }

    /// A callback (or the interpreter running it) panicked.
    pub fn panic(trigger: Trigger, id: u64, message: impl Into<String>) -> Self {
        Self {
            trigger,
            id,
            message: message.into(),
            panicked: true,
        }
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Task id or scheduler entry id, depending on the trigger.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The raw failure message, without the trigger prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn panicked(&self) -> bool {
        self.panicked
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.trigger, self.message)
    }
}

impl std::error::Error for TaskFailure {}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::TaskLimit { limit: 8 };
        assert_eq!(err.to_string(), "maximum number of tasks reached (8)");

        let err = RuntimeError::from(ChannelError::NotFound("jobs".into()));
        assert_eq!(err.to_string(), "channel jobs does not exist");

        let err = ScheduleError::UnknownEntry {
            kind: Trigger::Interval,
            id: EntryId::from(3),
        };
        assert_eq!(err.to_string(), "no interval with id 3");
    }

    #[test]
    fn test_failure_display() {
        let failure = TaskFailure::error(Trigger::Task, 1, "boom");
        assert_eq!(failure.to_string(), "task failure: boom");
        assert!(!failure.panicked());

        let failure = TaskFailure::panic(Trigger::Cron, 2, "index out of bounds");
        assert_eq!(failure.to_string(), "cron failure: index out of bounds");
        assert_eq!(failure.message(), "index out of bounds");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
