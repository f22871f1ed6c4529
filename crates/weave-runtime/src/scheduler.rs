//! Timers, intervals and cron entries.
//!
//! All three kinds share one state machine:
//!
//! ```text
//! Armed -> Firing -> Armed -> ... -> Cancelled
//!                 \-> Expired           (one-shot, or a cron with no future match)
//! ```
//!
//! Each entry runs on its own thread, which sleeps until the next deadline
//! on a crossbeam `select!` over the entry's cancel latch and the engine's
//! shutdown latch. A firing runs the callback through the same [`Isolate`]
//! as spawned tasks; failures go to the error sink.
//!
//! Firings happen on the entry's thread, so an interval never overlaps
//! itself. Ticks missed while a slow callback was running are skipped rather
//! than replayed. A firing that has already started when the entry is
//! cancelled runs to completion; none starts once `cancel` has returned.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::select;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};
use weave_channel::Latch;

use crate::context::{BindingOf, Bindings, CallbackOf, ContextOf, Interpreter};
use crate::error::{RuntimeError, ScheduleError, Trigger};
use crate::executor::Isolate;
use crate::RuntimeConfig;

/// Identifier of a scheduler entry. Ids start at 1 and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl EntryId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for EntryId {
    fn from(id: u64) -> Self {
        EntryId(id)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Convert script-facing seconds into a delay.
pub fn delay_from_secs(secs: f64) -> Result<Duration, ScheduleError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ScheduleError::InvalidDelay(secs))
}

// ============================================================================
// Schedules
// ============================================================================

/// A parsed cron expression.
///
/// Six fields (seconds first) and seven fields (with year) are accepted as
/// is; a classic five-field expression fires at second zero.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {}", trimmed)
        } else {
            trimmed.to_string()
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|err| ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The expression as given by the caller.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first occurrence strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}

/// When an entry fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Once, after the delay.
    OneShot(Duration),
    /// Every period, first firing one period from registration.
    Repeating(Duration),
    /// On every match of a cron expression.
    Cron(CronSchedule),
}

impl Schedule {
    pub fn trigger(&self) -> Trigger {
        match self {
            Schedule::OneShot(_) => Trigger::Timeout,
            Schedule::Repeating(_) => Trigger::Interval,
            Schedule::Cron(_) => Trigger::Cron,
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for the next deadline.
    Armed,
    /// The callback is running.
    Firing,
    Cancelled,
    Expired,
}

/// Snapshot of one live entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub id: EntryId,
    pub kind: Trigger,
    pub state: EntryState,
    pub fires: u64,
}

struct Entry {
    id: EntryId,
    kind: Trigger,
    state: Mutex<EntryState>,
    fires: AtomicU64,
    cancel: Latch,
}

impl Entry {
    fn new(id: EntryId, kind: Trigger) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(EntryState::Armed),
            fires: AtomicU64::new(0),
            cancel: Latch::new(),
        }
    }

    /// Move to `next` unless the entry already reached a final state.
    fn transition(&self, next: EntryState) {
        let mut state = self.state.lock();
        if !matches!(*state, EntryState::Cancelled | EntryState::Expired) {
            *state = next;
        }
    }

    fn cancel(&self) {
        *self.state.lock() = EntryState::Cancelled;
        self.cancel.set();
    }

    fn info(&self) -> EntryInfo {
        EntryInfo {
            id: self.id,
            kind: self.kind,
            state: *self.state.lock(),
            fires: self.fires.load(Ordering::Relaxed),
        }
    }
}

type EntryMap = Arc<RwLock<HashMap<EntryId, Arc<Entry>>>>;

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler<I: Interpreter> {
    isolate: Arc<Isolate<I>>,
    entries: EntryMap,
    next_id: AtomicU64,
    shutdown: Arc<Latch>,
    config: RuntimeConfig,
}

impl<I: Interpreter> Scheduler<I> {
    pub fn new(isolate: Arc<Isolate<I>>, shutdown: Arc<Latch>, config: RuntimeConfig) -> Self {
        Self {
            isolate,
            entries: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutdown,
            config,
        }
    }

    /// Run `callback` once after `delay`.
    pub fn set_timeout(
        &self,
        caller: &ContextOf<I>,
        callback: CallbackOf<I>,
        delay: Duration,
    ) -> Result<EntryId, RuntimeError> {
        self.register(caller, Schedule::OneShot(delay), callback)
    }

    /// Run `callback` every `period` until cancelled.
    pub fn set_interval(
        &self,
        caller: &ContextOf<I>,
        callback: CallbackOf<I>,
        period: Duration,
    ) -> Result<EntryId, RuntimeError> {
        if period.is_zero() {
            return Err(ScheduleError::InvalidDelay(0.0).into());
        }
        self.register(caller, Schedule::Repeating(period), callback)
    }

    /// Run `callback` on every match of `expression` until cancelled.
    ///
    /// A malformed expression fails here, before anything is armed.
    pub fn cron(
        &self,
        caller: &ContextOf<I>,
        expression: &str,
        callback: CallbackOf<I>,
    ) -> Result<EntryId, RuntimeError> {
        let schedule = CronSchedule::parse(expression)?;
        self.register(caller, Schedule::Cron(schedule), callback)
    }

    /// Arm a new entry.
    pub fn register(
        &self,
        caller: &ContextOf<I>,
        schedule: Schedule,
        callback: CallbackOf<I>,
    ) -> Result<EntryId, RuntimeError> {
        if self.shutdown.is_set() {
            return Err(RuntimeError::Shutdown);
        }

        if let Schedule::OneShot(delay) | Schedule::Repeating(delay) = &schedule {
            if Instant::now().checked_add(*delay).is_none() {
                return Err(ScheduleError::InvalidDelay(delay.as_secs_f64()).into());
            }
        }

        let bindings = self.config.allowlist.capture(caller);
        let id = EntryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let kind = schedule.trigger();
        let entry = Arc::new(Entry::new(id, kind));

        {
            let mut entries = self.entries.write();
            // Re-check under the lock so stop_all cannot miss this entry
            if self.shutdown.is_set() {
                return Err(RuntimeError::Shutdown);
            }
            entries.insert(id, Arc::clone(&entry));
        }

        let worker = EntryWorker {
            entry,
            schedule,
            bindings,
            callback,
            isolate: Arc::clone(&self.isolate),
            entries: Arc::clone(&self.entries),
            shutdown: Arc::clone(&self.shutdown),
        };

        let mut builder = thread::Builder::new().name(format!("weave-{}-{}", kind, id));
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        if let Err(err) = builder.spawn(move || worker.run()) {
            self.entries.write().remove(&id);
            return Err(RuntimeError::SpawnFailed(err.to_string()));
        }

        debug!(%kind, %id, "schedule armed");
        Ok(id)
    }

    /// Cancel a live entry of the given kind.
    ///
    /// Unknown ids, ids of another kind, and entries already cancelled or
    /// expired are all [`ScheduleError::UnknownEntry`].
    pub fn cancel(&self, id: EntryId, kind: Trigger) -> Result<(), RuntimeError> {
        let mut entries = self.entries.write();
        match entries.get(&id) {
            Some(entry) if entry.kind == kind => {}
            _ => return Err(ScheduleError::UnknownEntry { kind, id }.into()),
        }
        if let Some(entry) = entries.remove(&id) {
            entry.cancel();
        }
        drop(entries);

        debug!(%kind, %id, "schedule cancelled");
        Ok(())
    }

    /// Cancel every live entry. Returns how many were cancelled.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<_> = self.entries.write().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel();
        }
        debug!(stopped = drained.len(), "all schedules stopped");
        drained.len()
    }

    /// Live entries, ordered by id.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let mut infos: Vec<_> = self.entries.read().values().map(|entry| entry.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything an entry's thread owns.
struct EntryWorker<I: Interpreter> {
    entry: Arc<Entry>,
    schedule: Schedule,
    bindings: Bindings<BindingOf<I>>,
    callback: CallbackOf<I>,
    isolate: Arc<Isolate<I>>,
    entries: EntryMap,
    shutdown: Arc<Latch>,
}

impl<I: Interpreter> EntryWorker<I> {
    fn run(self) {
        let started = Instant::now();
        let mut last_cron: Option<DateTime<Utc>> = None;

        let mut deadline = match self.first_deadline(started, &mut last_cron) {
            Some(deadline) => deadline,
            None => return self.expire(),
        };

        loop {
            if !self.sleep_until(deadline) {
                trace!(id = %self.entry.id, "entry stopped");
                return;
            }

            if !self.fire() {
                trace!(id = %self.entry.id, "entry stopped");
                return;
            }

            let now = Instant::now();
            deadline = match &self.schedule {
                Schedule::OneShot(_) => return self.expire(),
                Schedule::Repeating(period) => match next_tick(deadline, *period, now) {
                    Some(next) => next,
                    None => return self.expire(),
                },
                Schedule::Cron(cron) => {
                    let after = match last_cron {
                        Some(last) => last.max(Utc::now()),
                        None => Utc::now(),
                    };
                    match cron.next_after(&after) {
                        Some(next) => {
                            last_cron = Some(next);
                            instant_for(next)
                        }
                        None => return self.expire(),
                    }
                }
            };
            self.entry.transition(EntryState::Armed);
        }
    }

    fn first_deadline(
        &self,
        started: Instant,
        last_cron: &mut Option<DateTime<Utc>>,
    ) -> Option<Instant> {
        match &self.schedule {
            Schedule::OneShot(delay) | Schedule::Repeating(delay) => started.checked_add(*delay),
            Schedule::Cron(cron) => {
                let next = cron.next_after(&Utc::now())?;
                *last_cron = Some(next);
                Some(instant_for(next))
            }
        }
    }

    /// Sleep until `deadline`. Returns false if the entry was cancelled or
    /// the engine shut down first.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let delay = deadline.saturating_duration_since(Instant::now());
        select! {
            recv(self.entry.cancel.watch()) -> _ => return false,
            recv(self.shutdown.watch()) -> _ => return false,
            default(delay) => {}
        }
        !(self.entry.cancel.is_set() || self.shutdown.is_set())
    }

    /// Run the callback once. Returns false without running it if the entry
    /// was cancelled or the engine shut down.
    fn fire(&self) -> bool {
        let id = self.entry.id;
        {
            // Cancel flips the state under this lock before returning
            let mut state = self.entry.state.lock();
            if self.entry.cancel.is_set()
                || self.shutdown.is_set()
                || matches!(*state, EntryState::Cancelled | EntryState::Expired)
            {
                return false;
            }
            *state = EntryState::Firing;
        }
        let fires = self.entry.fires.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(kind = %self.entry.kind, %id, fires, "schedule fired");

        self.isolate
            .run(&self.bindings, &self.callback, self.entry.kind, id.as_u64());
        true
    }

    fn expire(&self) {
        self.entry.transition(EntryState::Expired);
        let mut entries = self.entries.write();
        if entries
            .get(&self.entry.id)
            .is_some_and(|live| Arc::ptr_eq(live, &self.entry))
        {
            entries.remove(&self.entry.id);
        }
        trace!(kind = %self.entry.kind, id = %self.entry.id, "schedule expired");
    }
}

/// First tick after `now` on the grid `deadline + k * period`, skipping
/// ticks missed while the callback ran.
fn next_tick(deadline: Instant, period: Duration, now: Instant) -> Option<Instant> {
    let mut next = deadline.checked_add(period)?;
    while next <= now {
        next = next.checked_add(period)?;
    }
    Some(next)
}

/// Map a wall-clock time onto the monotonic clock.
fn instant_for(at: DateTime<Utc>) -> Instant {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + delay
}
