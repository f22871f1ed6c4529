//! Named channel registry.
//!
//! The registry maps channel names to [`Channel`]s behind a reader/writer
//! lock: lookups (send, receive, select) take the read lock only long enough
//! to clone the channel handle, structural changes (create, close, shutdown)
//! take the write lock. No lock is held while an operation blocks.
//!
//! A closed channel stays in the map as a tombstone until the name is
//! created again or the registry shuts down. That is what lets a receive on a
//! closed channel keep answering "empty" and a second close fail with
//! [`ChannelError::AlreadyClosed`] instead of a plain "does not exist".
//! Only the most recent [`DEFAULT_CLOSED_LIMIT`] tombstones are kept (see
//! [`ChannelRegistry::with_closed_limit`]); older closed names are removed
//! and behave like names that never existed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use tracing::{debug, trace};

use crate::channel::{Capacity, Channel, SendOutcome};
use crate::latch::Latch;
use crate::value::Value;
use crate::ChannelError;

/// Send timeout used when the caller does not give one.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive timeout used when the caller does not give one.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Closed channels remembered by name before the oldest are removed.
pub const DEFAULT_CLOSED_LIMIT: usize = 256;

pub struct ChannelRegistry {
    pub(crate) channels: RwLock<HashMap<SmolStr, Arc<Channel>>>,
    pub(crate) shutdown: Arc<Latch>,
    /// Tombstone names, oldest first. Only locked under the `channels`
    /// write lock.
    closed: Mutex<VecDeque<SmolStr>>,
    closed_limit: usize,
    send_timeout: Duration,
    receive_timeout: Duration,
}

impl ChannelRegistry {
    /// Create a registry with its own shutdown latch.
    pub fn new() -> Self {
        Self::with_shutdown(Arc::new(Latch::new()))
    }

    /// Create a registry that unblocks when `shutdown` is set.
    pub fn with_shutdown(shutdown: Arc<Latch>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            shutdown,
            closed: Mutex::new(VecDeque::new()),
            closed_limit: DEFAULT_CLOSED_LIMIT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    /// Override the default send and receive timeouts.
    pub fn with_timeouts(mut self, send: Duration, receive: Duration) -> Self {
        self.send_timeout = send;
        self.receive_timeout = receive;
        self
    }

    /// Keep at most `limit` closed channels as tombstones.
    pub fn with_closed_limit(mut self, limit: usize) -> Self {
        self.closed_limit = limit;
        self
    }

    pub fn send_timeout_default(&self) -> Duration {
        self.send_timeout
    }

    pub fn receive_timeout_default(&self) -> Duration {
        self.receive_timeout
    }

    pub(crate) fn ensure_running(&self) -> Result<(), ChannelError> {
        if self.shutdown.is_set() {
            Err(ChannelError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Create a channel holding up to `capacity` values (0 = rendezvous).
    pub fn create(&self, name: &str, capacity: usize) -> Result<(), ChannelError> {
        self.create_with(name, Capacity::from_size(capacity))
    }

    /// Create a channel whose senders never block.
    pub fn create_unbounded(&self, name: &str) -> Result<(), ChannelError> {
        self.create_with(name, Capacity::Unbounded)
    }

    pub fn create_with(&self, name: &str, capacity: Capacity) -> Result<(), ChannelError> {
        self.ensure_running()?;

        let mut channels = self.channels.write();
        // Re-check under the write lock so shutdown cannot race a create
        self.ensure_running()?;

        if let Some(existing) = channels.get(name) {
            if !existing.is_closed() {
                return Err(ChannelError::AlreadyExists(name.into()));
            }
            self.closed.lock().retain(|closed| closed != name);
        }

        let name = SmolStr::new(name);
        channels.insert(name.clone(), Arc::new(Channel::new(name.clone(), capacity)));
        debug!(channel = %name, ?capacity, "channel created");
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Arc<Channel>, ChannelError> {
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ChannelError::NotFound(name.into()))
    }

    /// Send with the default timeout. Returns whether the value was delivered.
    pub fn send(&self, name: &str, value: Value) -> Result<bool, ChannelError> {
        self.send_timeout(name, value, self.send_timeout)
    }

    /// Send `value`, waiting at most `timeout` for buffer space.
    ///
    /// `Ok(false)` means the value was not delivered because the timeout
    /// elapsed or the registry shut down while waiting.
    pub fn send_timeout(
        &self,
        name: &str,
        value: Value,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        self.ensure_running()?;
        let channel = self.lookup(name)?;

        let outcome = channel.send(value, timeout, &self.shutdown)?;
        trace!(channel = %name, ?outcome, "send");
        Ok(outcome == SendOutcome::Delivered)
    }

    /// Receive with the default timeout.
    pub fn receive(&self, name: &str) -> Result<Option<Value>, ChannelError> {
        self.receive_timeout(name, self.receive_timeout)
    }

    /// Receive the next value, waiting at most `timeout`.
    ///
    /// `Ok(None)` is returned immediately for a closed channel, and after
    /// waiting when the timeout elapses or the registry shuts down.
    pub fn receive_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, ChannelError> {
        self.ensure_running()?;
        let channel = self.lookup(name)?;

        let value = channel.receive(timeout, &self.shutdown);
        trace!(channel = %name, received = value.is_some(), "receive");
        Ok(value)
    }

    /// Close a channel, waking every operation blocked on it.
    pub fn close(&self, name: &str) -> Result<(), ChannelError> {
        self.ensure_running()?;

        let mut channels = self.channels.write();
        let channel = channels
            .get(name)
            .ok_or_else(|| ChannelError::NotFound(name.into()))?;

        if !channel.close() {
            return Err(ChannelError::AlreadyClosed(name.into()));
        }

        let mut closed = self.closed.lock();
        closed.push_back(SmolStr::new(name));
        while closed.len() > self.closed_limit {
            let Some(oldest) = closed.pop_front() else {
                break;
            };
            if channels.get(&oldest).is_some_and(|channel| channel.is_closed()) {
                channels.remove(&oldest);
                trace!(channel = %oldest, "tombstone removed");
            }
        }

        debug!(channel = %name, "channel closed");
        Ok(())
    }

    /// Force-close every open channel and empty the registry.
    ///
    /// Returns the number of channels that were still open.
    pub fn close_all(&self) -> usize {
        let mut channels = self.channels.write();
        self.closed.lock().clear();
        let closed = channels
            .drain()
            .filter(|(_, channel)| channel.close())
            .count();
        debug!(closed, "all channels closed");
        closed
    }

    /// Set the shutdown latch and close every channel.
    ///
    /// Blocked operations return their shutdown result; later calls fail with
    /// [`ChannelError::Shutdown`].
    pub fn shutdown(&self) -> usize {
        self.shutdown.set();
        self.close_all()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Check whether `name` refers to an open channel.
    pub fn is_open(&self, name: &str) -> bool {
        self.channels
            .read()
            .get(name)
            .is_some_and(|channel| !channel.is_closed())
    }

    /// Number of open channels.
    pub fn open_count(&self) -> usize {
        self.channels
            .read()
            .values()
            .filter(|channel| !channel.is_closed())
            .count()
    }

    /// Number of closed channels still remembered as tombstones.
    pub fn closed_count(&self) -> usize {
        self.closed.lock().len()
    }

    /// Names of the open channels, sorted.
    pub fn names(&self) -> Vec<SmolStr> {
        let mut names: Vec<_> = self
            .channels
            .read()
            .iter()
            .filter(|(_, channel)| !channel.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of values buffered in `name`.
    pub fn buffered(&self, name: &str) -> Result<usize, ChannelError> {
        Ok(self.lookup(name)?.len())
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("open", &self.open_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(30);

    #[test]
    fn test_create_duplicate_fails() {
        let registry = ChannelRegistry::new();
        registry.create("jobs", 4).unwrap();
        assert_eq!(
            registry.create("jobs", 4),
            Err(ChannelError::AlreadyExists("jobs".into()))
        );
    }

    #[test]
    fn test_unknown_channel() {
        let registry = ChannelRegistry::new();
        assert_eq!(
            registry.send("missing", Value::Nil),
            Err(ChannelError::NotFound("missing".into()))
        );
        assert_eq!(
            registry.receive("missing"),
            Err(ChannelError::NotFound("missing".into()))
        );
        assert_eq!(
            registry.close("missing"),
            Err(ChannelError::NotFound("missing".into()))
        );
    }

    #[test]
    fn test_fifo_order() {
        let registry = ChannelRegistry::new();
        registry.create_unbounded("q").unwrap();
        for i in 0..5 {
            assert!(registry.send("q", Value::Int(i)).unwrap());
        }
        let received: Vec<_> = (0..5)
            .map(|_| registry.receive("q").unwrap().unwrap())
            .collect();
        assert_eq!(received, (0..5).map(Value::Int).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_keeps_tombstone() {
        let registry = ChannelRegistry::new();
        registry.create("c", 1).unwrap();
        registry.close("c").unwrap();

        assert!(!registry.is_open("c"));
        assert_eq!(registry.receive("c"), Ok(None));
        assert_eq!(registry.send("c", Value::Nil), Err(ChannelError::Closed("c".into())));
        assert_eq!(registry.close("c"), Err(ChannelError::AlreadyClosed("c".into())));
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let registry = ChannelRegistry::new().with_closed_limit(8);
        for i in 0..1000 {
            let name = format!("job-{}", i);
            registry.create(&name, 1).unwrap();
            registry.close(&name).unwrap();
        }

        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.closed_count(), 8);
        assert_eq!(registry.channels.read().len(), 8);

        // Recent tombstones still answer as closed, old ones are gone
        assert_eq!(registry.receive("job-999"), Ok(None));
        assert_eq!(
            registry.close("job-999"),
            Err(ChannelError::AlreadyClosed("job-999".into()))
        );
        assert_eq!(
            registry.receive("job-0"),
            Err(ChannelError::NotFound("job-0".into()))
        );
    }

    #[test]
    fn test_eviction_skips_recreated_names() {
        let registry = ChannelRegistry::new().with_closed_limit(1);
        registry.create("a", 1).unwrap();
        registry.close("a").unwrap();
        registry.create("a", 1).unwrap();
        assert_eq!(registry.closed_count(), 0);

        registry.create("b", 1).unwrap();
        registry.close("b").unwrap();
        registry.create("c", 1).unwrap();
        registry.close("c").unwrap();

        assert!(registry.is_open("a"));
        assert_eq!(registry.receive("c"), Ok(None));
        assert_eq!(registry.receive("b"), Err(ChannelError::NotFound("b".into())));
    }

    #[test]
    fn test_recreate_after_close() {
        let registry = ChannelRegistry::new();
        registry.create("c", 1).unwrap();
        registry.close("c").unwrap();
        registry.create("c", 1).unwrap();

        assert!(registry.send("c", Value::from("again")).unwrap());
        assert_eq!(registry.receive("c").unwrap(), Some(Value::from("again")));
    }

    #[test]
    fn test_receive_timeout_returns_empty() {
        let registry = ChannelRegistry::new();
        registry.create("c", 1).unwrap();

        let start = Instant::now();
        assert_eq!(registry.receive_timeout("c", SHORT), Ok(None));
        assert!(start.elapsed() >= SHORT);
    }

    #[test]
    fn test_shutdown_rejects_new_operations() {
        let registry = ChannelRegistry::new();
        registry.create("a", 1).unwrap();
        registry.create("b", 1).unwrap();
        registry.close("b").unwrap();

        assert_eq!(registry.shutdown(), 1);
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.create("a", 1), Err(ChannelError::Shutdown));
        assert_eq!(registry.send("a", Value::Nil), Err(ChannelError::Shutdown));
        assert_eq!(registry.receive("a"), Err(ChannelError::Shutdown));
        assert_eq!(registry.close("a"), Err(ChannelError::Shutdown));
    }

    #[test]
    fn test_shutdown_unblocks_sender() {
        let registry = Arc::new(ChannelRegistry::new());
        registry.create("c", 0).unwrap();

        let sender = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.send_timeout("c", Value::Int(1), Duration::from_secs(10)))
        };

        thread::sleep(SHORT);
        registry.shutdown();
        assert_eq!(sender.join().unwrap(), Ok(false));
    }

    #[test]
    fn test_names_lists_open_channels() {
        let registry = ChannelRegistry::new();
        registry.create("b", 1).unwrap();
        registry.create("a", 1).unwrap();
        registry.create("z", 1).unwrap();
        registry.close("z").unwrap();

        assert_eq!(registry.names(), vec![SmolStr::new("a"), SmolStr::new("b")]);
        assert_eq!(registry.open_count(), 2);
    }
}
