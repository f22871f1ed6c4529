//! Error sink for failures that have no synchronous caller.
//!
//! Tasks and scheduled callbacks run long after the call that started them
//! returned, so their failures are delivered here instead. Handlers are
//! called in registration order, each with the same [`TaskFailure`]. With no
//! handler registered a failure is counted and then dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{panic_message, TaskFailure};

/// A registered failure handler.
pub type FailureHandler = Arc<dyn Fn(&TaskFailure) + Send + Sync>;

#[derive(Default)]
pub struct ErrorSink {
    handlers: RwLock<Vec<FailureHandler>>,
    reported: AtomicU64,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every future failure.
    pub fn register<F>(&self, handler: F)
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Deliver `failure` to every handler.
    ///
    /// A panicking handler is logged and skipped; it never takes down the
    /// thread that reported the failure.
    pub fn report(&self, failure: TaskFailure) {
        self.reported.fetch_add(1, Ordering::Relaxed);

        // Clone the list so handlers can register more handlers
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&failure)));
            if let Err(payload) = result {
                warn!(
                    trigger = %failure.trigger(),
                    panic = %panic_message(payload.as_ref()),
                    "error handler panicked"
                );
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Total number of failures reported so far.
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSink")
            .field("handlers", &self.handler_count())
            .field("reported", &self.reported())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Trigger;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_without_handlers_is_dropped() {
        let sink = ErrorSink::new();
        sink.report(TaskFailure::error(Trigger::Task, 1, "lost"));
        assert_eq!(sink.reported(), 1);
    }

    #[test]
    fn test_handlers_run_in_order() {
        let sink = ErrorSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            sink.register(move |failure| {
                seen.lock().push(format!("{}: {}", tag, failure));
            });
        }

        sink.report(TaskFailure::error(Trigger::Interval, 4, "bad tick"));
        assert_eq!(
            *seen.lock(),
            vec![
                "first: interval failure: bad tick".to_string(),
                "second: interval failure: bad tick".to_string(),
            ]
        );
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let sink = ErrorSink::new();
        let delivered = Arc::new(AtomicU64::new(0));

        sink.register(|_| panic!("handler bug"));
        let counter = Arc::clone(&delivered);
        sink.register(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        sink.report(TaskFailure::error(Trigger::Task, 1, "boom"));
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        assert_eq!(sink.handler_count(), 2);
    }
}
