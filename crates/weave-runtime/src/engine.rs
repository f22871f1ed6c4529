//! The engine: one owned instance of every runtime registry.
//!
//! An [`Engine`] ties the channel registry, the dispatcher, the join barrier
//! and the scheduler to a single shutdown latch. Nothing is global, so
//! several engines can live side by side (one per script host, or one per
//! test).
//!
//! # Shutdown
//!
//! [`Engine::shutdown`] sets the latch first, which unblocks every pending
//! send, receive and select with its shutdown result. It then force-closes
//! the channels, stops every timer, interval and cron entry, and drops the
//! idle contexts. Running tasks are not interrupted; they finish on their own
//! once their blocking calls return.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use weave_channel::{ChannelRegistry, Latch, Selected, Value};

use crate::barrier::TaskTracker;
use crate::context::{CallbackOf, ContextOf, ContextPool, Interpreter};
use crate::error::{RuntimeError, TaskFailure, Trigger};
use crate::executor::{Dispatcher, Isolate, TaskId};
use crate::scheduler::{EntryId, EntryInfo, Scheduler};
use crate::sink::ErrorSink;
use crate::RuntimeConfig;

/// Point-in-time counters of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Tasks admitted and not yet finished.
    pub running_tasks: usize,
    /// Tasks ever admitted.
    pub spawned_total: u64,
    /// Failures delivered to the error sink.
    pub failed_total: u64,
    pub open_channels: usize,
    /// Live timer, interval and cron entries.
    pub scheduled_entries: usize,
    /// Contexts parked in the pool.
    pub idle_contexts: usize,
}

pub struct Engine<I: Interpreter> {
    config: RuntimeConfig,
    shutdown: Arc<Latch>,
    channels: Arc<ChannelRegistry>,
    isolate: Arc<Isolate<I>>,
    tracker: Arc<TaskTracker>,
    dispatcher: Dispatcher<I>,
    scheduler: Scheduler<I>,
}

impl<I: Interpreter> Engine<I> {
    pub fn new(interpreter: I) -> Self {
        Self::with_config(interpreter, RuntimeConfig::default())
    }

    pub fn with_config(interpreter: I, config: RuntimeConfig) -> Self {
        let shutdown = Arc::new(Latch::new());
        let channels = Arc::new(
            ChannelRegistry::with_shutdown(Arc::clone(&shutdown))
                .with_timeouts(config.send_timeout, config.receive_timeout)
                .with_closed_limit(config.max_closed_channels),
        );

        let pool = ContextPool::new(Arc::new(interpreter), config.max_idle_contexts);
        let isolate = Arc::new(Isolate::new(pool, Arc::new(ErrorSink::new())));
        let tracker = Arc::new(TaskTracker::new());

        let dispatcher = Dispatcher::new(
            Arc::clone(&isolate),
            Arc::clone(&tracker),
            Arc::clone(&shutdown),
            config.clone(),
        );
        let scheduler = Scheduler::new(Arc::clone(&isolate), Arc::clone(&shutdown), config.clone());

        debug!(
            max_tasks = ?config.max_tasks,
            allowlist = config.allowlist.version(),
            "engine started"
        );

        Self {
            config,
            shutdown,
            channels,
            isolate,
            tracker,
            dispatcher,
            scheduler,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn interpreter(&self) -> &Arc<I> {
        self.isolate.pool().interpreter()
    }

    /// Build a context outside the pool, e.g. for the host's main script.
    pub fn new_context(&self) -> ContextOf<I> {
        self.interpreter().new_context()
    }

    /// The channel registry, for handing to native builtins.
    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn scheduler(&self) -> &Scheduler<I> {
        &self.scheduler
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Run `callback` concurrently in an isolated context.
    pub fn spawn(
        &self,
        caller: &ContextOf<I>,
        callback: CallbackOf<I>,
    ) -> Result<TaskId, RuntimeError> {
        self.dispatcher.spawn(caller, callback)
    }

    /// Block until every spawned task finished, or fail after the configured
    /// join timeout.
    pub fn join_wait(&self) -> Result<(), RuntimeError> {
        self.wait_timeout(self.config.join_timeout)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.tracker.wait(timeout)
    }

    /// Ids of the tasks currently running.
    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.tracker.running_ids()
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub fn channel_create(&self, name: &str, capacity: usize) -> Result<(), RuntimeError> {
        Ok(self.channels.create(name, capacity)?)
    }

    /// Send with the configured timeout. Returns whether the value was
    /// delivered.
    pub fn channel_send(&self, name: &str, value: Value) -> Result<bool, RuntimeError> {
        Ok(self.channels.send(name, value)?)
    }

    pub fn channel_send_timeout(
        &self,
        name: &str,
        value: Value,
        timeout: Duration,
    ) -> Result<bool, RuntimeError> {
        Ok(self.channels.send_timeout(name, value, timeout)?)
    }

    /// Receive with the configured timeout. `None` means closed, timed out,
    /// or shut down.
    pub fn channel_receive(&self, name: &str) -> Result<Option<Value>, RuntimeError> {
        Ok(self.channels.receive(name)?)
    }

    pub fn channel_receive_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, RuntimeError> {
        Ok(self.channels.receive_timeout(name, timeout)?)
    }

    pub fn channel_select(&self, names: &[&str]) -> Result<Selected, RuntimeError> {
        Ok(self.channels.select(names)?)
    }

    pub fn channel_select_timeout(
        &self,
        names: &[&str],
        timeout: Duration,
    ) -> Result<Selected, RuntimeError> {
        Ok(self.channels.select_timeout(names, timeout)?)
    }

    pub fn channel_close(&self, name: &str) -> Result<(), RuntimeError> {
        Ok(self.channels.close(name)?)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    pub fn set_timeout(
        &self,
        caller: &ContextOf<I>,
        callback: CallbackOf<I>,
        delay: Duration,
    ) -> Result<EntryId, RuntimeError> {
        self.scheduler.set_timeout(caller, callback, delay)
    }

    pub fn set_interval(
        &self,
        caller: &ContextOf<I>,
        callback: CallbackOf<I>,
        period: Duration,
    ) -> Result<EntryId, RuntimeError> {
        self.scheduler.set_interval(caller, callback, period)
    }

    pub fn cron(
        &self,
        caller: &ContextOf<I>,
        expression: &str,
        callback: CallbackOf<I>,
    ) -> Result<EntryId, RuntimeError> {
        self.scheduler.cron(caller, expression, callback)
    }

    pub fn cancel_timeout(&self, id: EntryId) -> Result<(), RuntimeError> {
        self.scheduler.cancel(id, Trigger::Timeout)
    }

    pub fn cancel_interval(&self, id: EntryId) -> Result<(), RuntimeError> {
        self.scheduler.cancel(id, Trigger::Interval)
    }

    pub fn cancel_cron(&self, id: EntryId) -> Result<(), RuntimeError> {
        self.scheduler.cancel(id, Trigger::Cron)
    }

    pub fn scheduled(&self) -> Vec<EntryInfo> {
        self.scheduler.entries()
    }

    // ------------------------------------------------------------------
    // Errors and introspection
    // ------------------------------------------------------------------

    /// Register a handler for failures of tasks and scheduled callbacks.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        self.isolate.sink().register(handler);
    }

    pub fn error_sink(&self) -> &Arc<ErrorSink> {
        self.isolate.sink()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            running_tasks: self.tracker.outstanding(),
            spawned_total: self.tracker.spawned(),
            failed_total: self.isolate.sink().reported(),
            open_channels: self.channels.open_count(),
            scheduled_entries: self.scheduler.len(),
            idle_contexts: self.isolate.pool().idle_count(),
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Unblock all waiters, close every channel and stop every entry.
    ///
    /// Fails with [`RuntimeError::Shutdown`] if the engine was already shut
    /// down.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        if !self.shutdown.set() {
            return Err(RuntimeError::Shutdown);
        }

        let channels = self.channels.close_all();
        let entries = self.scheduler.stop_all();
        self.isolate.pool().clear();

        debug!(channels, entries, outstanding = self.tracker.outstanding(), "engine shut down");
        Ok(())
    }
}

impl<I: Interpreter> Drop for Engine<I> {
    fn drop(&mut self) {
        if !self.shutdown.is_set() {
            let _ = self.shutdown();
        }
    }
}

impl<I: Interpreter> std::fmt::Debug for Engine<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stats", &self.stats())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
