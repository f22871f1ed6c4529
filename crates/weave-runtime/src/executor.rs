//! The task dispatcher.
//!
//! Each spawned task runs on its own OS thread with a context taken from the
//! [`ContextPool`]. The thread owns the task's [`TaskPermit`], so the join
//! barrier sees the task as outstanding from the moment `spawn` accepts it
//! until the thread has released its context.
//!
//! [`Isolate`] is the fault boundary shared with the scheduler: it acquires a
//! context, installs the captured bindings, runs the callback, and turns any
//! error or panic into a [`TaskFailure`] for the error sink.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, trace};
use weave_channel::Latch;

use crate::barrier::TaskTracker;
use crate::context::{
    BindingOf, Bindings, CallbackOf, ContextOf, ContextPool, ExecutionContext, Interpreter,
};
use crate::error::{panic_message, RuntimeError, TaskFailure, Trigger};
use crate::sink::ErrorSink;
use crate::RuntimeConfig;

/// Unique identifier for a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Generate a new unique task ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

// ============================================================================
// Fault boundary
// ============================================================================

/// Runs callbacks in pooled contexts and reports their failures.
pub struct Isolate<I: Interpreter> {
    pool: ContextPool<I>,
    sink: Arc<ErrorSink>,
}

impl<I: Interpreter> Isolate<I> {
    pub fn new(pool: ContextPool<I>, sink: Arc<ErrorSink>) -> Self {
        Self { pool, sink }
    }

    pub fn pool(&self) -> &ContextPool<I> {
        &self.pool
    }

    pub fn sink(&self) -> &Arc<ErrorSink> {
        &self.sink
    }

    /// Run `callback` once in a fresh or recycled context.
    ///
    /// Returns whether the callback completed without error. Nothing raised
    /// by the callback or the interpreter escapes this call.
    pub fn run(
        &self,
        bindings: &Bindings<BindingOf<I>>,
        callback: &CallbackOf<I>,
        trigger: Trigger,
        id: u64,
    ) -> bool {
        let mut context = match recover(|| self.pool.acquire()) {
            Ok(context) => context,
            Err(message) => {
                self.sink.report(TaskFailure::panic(trigger, id, message));
                return false;
            }
        };

        let result = recover(|| {
            bindings.apply(&mut context);
            context.call(callback).map_err(|err| err.to_string())
        });

        match result {
            Ok(Ok(())) => self.release(context, trigger, id),
            Ok(Err(message)) => {
                self.release(context, trigger, id);
                self.sink.report(TaskFailure::error(trigger, id, message));
                false
            }
            Err(message) => {
                // A context that unwound mid-call is never reused
                let _ = recover(|| self.pool.discard(context));
                self.sink.report(TaskFailure::panic(trigger, id, message));
                false
            }
        }
    }

    fn release(&self, context: ContextOf<I>, trigger: Trigger, id: u64) -> bool {
        match recover(|| self.pool.release(context)) {
            Ok(()) => true,
            Err(message) => {
                self.sink.report(TaskFailure::panic(trigger, id, message));
                false
            }
        }
    }
}

fn recover<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

// ============================================================================
// Dispatcher
// ============================================================================

/// The spawn primitive.
pub struct Dispatcher<I: Interpreter> {
    isolate: Arc<Isolate<I>>,
    tracker: Arc<TaskTracker>,
    shutdown: Arc<Latch>,
    config: RuntimeConfig,
}

impl<I: Interpreter> Dispatcher<I> {
    pub fn new(
        isolate: Arc<Isolate<I>>,
        tracker: Arc<TaskTracker>,
        shutdown: Arc<Latch>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            isolate,
            tracker,
            shutdown,
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    /// Start `callback` on its own thread.
    ///
    /// Fails fast with [`RuntimeError::TaskLimit`] when the ceiling is
    /// reached; nothing is queued. The allowed bindings of `caller` are
    /// captured before this returns. The callback's outcome is only
    /// observable through the error sink and the join barrier.
    pub fn spawn(
        &self,
        caller: &ContextOf<I>,
        callback: CallbackOf<I>,
    ) -> Result<TaskId, RuntimeError> {
        if self.shutdown.is_set() {
            return Err(RuntimeError::Shutdown);
        }

        let id = TaskId::new();
        let permit = self
            .tracker
            .try_acquire(self.config.max_tasks, id)
            .ok_or(RuntimeError::TaskLimit {
                limit: self.config.max_tasks.unwrap_or(usize::MAX),
            })?;

        let bindings = self.config.allowlist.capture(caller);
        let isolate = Arc::clone(&self.isolate);

        let thread_name = format!("{}-{}", self.config.thread_name_prefix, id.as_u64());
        let mut builder = thread::Builder::new().name(thread_name);
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        builder
            .spawn(move || {
                let _permit = permit;
                trace!(task = %id, "task started");
                let ok = isolate.run(&bindings, &callback, Trigger::Task, id.as_u64());
                trace!(task = %id, ok, "task finished");
            })
            .map_err(|err| RuntimeError::SpawnFailed(err.to_string()))?;

        debug!(task = %id, outstanding = self.tracker.outstanding(), "task spawned");
        Ok(id)
    }
}
