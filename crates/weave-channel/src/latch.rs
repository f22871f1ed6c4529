//! One-shot broadcast latch.
//!
//! A `Latch` starts open and can be set exactly once. Setting it drops the
//! only sender of an internal zero-capacity channel, which disconnects the
//! receiver returned by [`Latch::watch`]. A disconnected receiver is always
//! ready, so any number of threads blocked in a crossbeam `Select` that
//! includes the watch receiver wake up at once.
//!
//! The runtime uses one latch for engine shutdown, one per channel for its
//! closed state and one per scheduled entry for cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

pub struct Latch {
    set: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    watch: Receiver<()>,
}

impl Latch {
    /// Create a latch in the open state.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            set: AtomicBool::new(false),
            trigger: Mutex::new(Some(tx)),
            watch: rx,
        }
    }

    /// Set the latch, waking every watcher.
    ///
    /// Returns `false` if the latch was already set.
    pub fn set(&self) -> bool {
        if self.set.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.trigger.lock().take();
        true
    }

    /// Check whether the latch has been set.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Receiver that becomes ready (disconnected) once the latch is set.
    ///
    /// Nothing is ever sent on it; a `recv` returns `Err` after `set`.
    pub fn watch(&self) -> &Receiver<()> {
        &self.watch
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_set_once() {
        let latch = Latch::new();
        assert!(!latch.is_set());
        assert!(latch.set());
        assert!(latch.is_set());
        assert!(!latch.set());
    }

    #[test]
    fn test_watch_blocks_until_set() {
        let latch = Latch::new();
        assert!(latch
            .watch()
            .recv_timeout(Duration::from_millis(20))
            .unwrap_err()
            .is_timeout());

        latch.set();
        assert!(latch.watch().recv().is_err());
        // Stays ready after the first observation
        assert!(latch.watch().recv().is_err());
    }

    #[test]
    fn test_set_wakes_all_watchers() {
        let latch = Arc::new(Latch::new());
        let start = Instant::now();

        let watchers: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.watch().recv().is_err())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        latch.set();

        for watcher in watchers {
            assert!(watcher.join().unwrap());
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
