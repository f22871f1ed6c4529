//! Outstanding-task accounting and the join barrier.
//!
//! Every accepted spawn holds a [`TaskPermit`] for as long as its task
//! runs. The permit is taken with a compare-and-swap against the task
//! ceiling, so admission and counting are one atomic step; dropping it (on
//! completion or after a recovered panic) decrements the counter and wakes
//! joiners once the count reaches zero.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::RuntimeError;
use crate::executor::TaskId;

/// Default ceiling for [`TaskTracker::wait`].
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct TaskTracker {
    outstanding: AtomicUsize,
    spawned: AtomicU64,
    running: Mutex<BTreeSet<TaskId>>,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one task unless `limit` tasks are already outstanding.
    pub fn try_acquire(self: &Arc<Self>, limit: Option<usize>, id: TaskId) -> Option<TaskPermit> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| match limit {
                Some(limit) if count >= limit => None,
                _ => Some(count + 1),
            })
            .ok()?;

        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.running.lock().insert(id);
        Some(TaskPermit {
            tracker: Arc::clone(self),
            id,
        })
    }

    fn release(&self, id: TaskId) {
        self.running.lock().remove(&id);
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Take the lock so a joiner between its check and its wait
            // cannot miss this notification
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    /// Block until no task is outstanding, or fail after `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<(), RuntimeError> {
        let mut guard = self.idle_lock.lock();
        let deadline = Instant::now().checked_add(timeout);

        while self.outstanding() > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut guard, deadline).timed_out()
                        && self.outstanding() > 0
                    {
                        return Err(RuntimeError::WaitTimeout(timeout));
                    }
                }
                None => self.idle.wait(&mut guard),
            }
        }
        Ok(())
    }

    /// Number of tasks admitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of tasks ever admitted.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Ids of the tasks currently running, ascending.
    pub fn running_ids(&self) -> Vec<TaskId> {
        self.running.lock().iter().copied().collect()
    }
}

/// Membership of one task in the outstanding count.
#[derive(Debug)]
pub struct TaskPermit {
    tracker: Arc<TaskTracker>,
    id: TaskId,
}

impl TaskPermit {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}
