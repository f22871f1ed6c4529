//! Weave Runtime - concurrent task execution and scheduling for untrusted scripts
//!
//! This crate provides:
//! - `Engine` - owns every registry below and coordinates shutdown
//! - `Dispatcher` - the spawn primitive, with a task ceiling
//! - `TaskTracker` - outstanding-task accounting and the join barrier
//! - `Scheduler` - one-shot timers, intervals and cron entries
//! - `ContextPool` - isolated interpreter contexts, recycled between tasks
//! - `ErrorSink` - where task and timer failures are delivered
//!
//! Channels live in the `weave-channel` crate and are re-exported here.
//!
//! # Isolation
//!
//! A task never shares a mutable interpreter context with its caller or with
//! another task. Only the builtins named in the [`BindingAllowlist`] are
//! copied into its context, and every execution runs behind a fault boundary
//! that turns errors and panics into a [`TaskFailure`] for the error sink.
//!
//! # Example
//!
//! ```rust
//! use weave_runtime::native::{NativeCallback, NativeInterpreter};
//! use weave_runtime::{Engine, Value};
//!
//! let engine = Engine::new(NativeInterpreter::new());
//! engine.channel_create("results", 4).unwrap();
//!
//! let channels = engine.channels().clone();
//! let caller = engine.new_context();
//! engine
//!     .spawn(&caller, NativeCallback::new(move |_| {
//!         channels.send("results", Value::Int(42)).map_err(|e| e.to_string())?;
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! engine.join_wait().unwrap();
//! assert_eq!(engine.channel_receive("results").unwrap(), Some(Value::Int(42)));
//! engine.shutdown().unwrap();
//! ```

pub mod barrier;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod native;
pub mod scheduler;
pub mod sink;

use std::time::Duration;

pub use barrier::{TaskPermit, TaskTracker, DEFAULT_JOIN_TIMEOUT};
pub use context::{
    BindingAllowlist, Bindings, ContextPool, ExecutionContext, Interpreter,
    DEFAULT_MAX_IDLE_CONTEXTS,
};
pub use engine::{Engine, EngineStats};
pub use error::{RuntimeError, ScheduleError, TaskFailure, Trigger};
pub use executor::{Dispatcher, Isolate, TaskId};
pub use scheduler::{
    delay_from_secs, CronSchedule, EntryId, EntryInfo, EntryState, Schedule, Scheduler,
};
pub use sink::{ErrorSink, FailureHandler};
pub use weave_channel::{
    Capacity, ChannelError, ChannelRegistry, Latch, Selected, Value, DEFAULT_CLOSED_LIMIT,
    DEFAULT_RECEIVE_TIMEOUT, DEFAULT_SEND_TIMEOUT,
};

/// Configuration for an [`Engine`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name prefix for task threads
    pub thread_name_prefix: String,
    /// Stack size for task and timer threads (bytes)
    pub stack_size: Option<usize>,
    /// Maximum number of concurrently running tasks; `None` is unlimited
    pub max_tasks: Option<usize>,
    /// Ceiling for [`Engine::join_wait`]
    pub join_timeout: Duration,
    /// Default send timeout
    pub send_timeout: Duration,
    /// Default receive timeout
    pub receive_timeout: Duration,
    /// Idle contexts kept for reuse
    pub max_idle_contexts: usize,
    /// Closed channels remembered by name
    pub max_closed_channels: usize,
    /// Bindings copied into every task context
    pub allowlist: BindingAllowlist,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "weave-task".to_string(),
            stack_size: None,
            max_tasks: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            max_idle_contexts: DEFAULT_MAX_IDLE_CONTEXTS,
            max_closed_channels: DEFAULT_CLOSED_LIMIT,
            allowlist: BindingAllowlist::V1,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for spawned threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Reject spawns once `limit` tasks are running.
    pub fn with_max_tasks(mut self, limit: usize) -> Self {
        self.max_tasks = Some(limit);
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_max_idle_contexts(mut self, count: usize) -> Self {
        self.max_idle_contexts = count;
        self
    }

    pub fn with_max_closed_channels(mut self, count: usize) -> Self {
        self.max_closed_channels = count;
        self
    }

    pub fn with_allowlist(mut self, allowlist: BindingAllowlist) -> Self {
        self.allowlist = allowlist;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.thread_name_prefix, "weave-task");
        assert!(config.stack_size.is_none());
        assert!(config.max_tasks.is_none());
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert_eq!(config.send_timeout, Duration::from_secs(1));
        assert_eq!(config.receive_timeout, Duration::from_secs(1));
        assert_eq!(config.max_closed_channels, 256);
        assert_eq!(config.allowlist, BindingAllowlist::V1);
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_thread_name_prefix("custom")
            .with_stack_size(1024 * 1024)
            .with_max_tasks(8)
            .with_join_timeout(Duration::from_secs(5))
            .with_max_idle_contexts(2)
            .with_max_closed_channels(16);

        assert_eq!(config.thread_name_prefix, "custom");
        assert_eq!(config.stack_size, Some(1024 * 1024));
        assert_eq!(config.max_tasks, Some(8));
        assert_eq!(config.join_timeout, Duration::from_secs(5));
        assert_eq!(config.max_idle_contexts, 2);
        assert_eq!(config.max_closed_channels, 16);
    }
}
