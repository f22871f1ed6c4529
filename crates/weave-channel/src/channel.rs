//! A single named channel.
//!
//! Each channel wraps a crossbeam channel (bounded, unbounded or zero
//! capacity) together with a closed [`Latch`]. Both endpoints are owned by
//! the channel itself, so the crossbeam channel never disconnects; closure is
//! signalled through the latch instead. Every blocking operation selects over
//! the data operation, the closed latch and the engine shutdown latch.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender};
use smol_str::SmolStr;

use crate::latch::Latch;
use crate::value::Value;
use crate::ChannelError;

/// Buffering policy of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Synchronous handoff: a send completes only when a receiver takes it.
    Rendezvous,
    /// At most `n` values are buffered before senders block.
    Bounded(usize),
    /// Senders never block.
    Unbounded,
}

impl Capacity {
    /// Map a script-level buffer size to a capacity (0 = rendezvous).
    pub fn from_size(size: usize) -> Self {
        if size == 0 {
            Capacity::Rendezvous
        } else {
            Capacity::Bounded(size)
        }
    }

    /// Buffer size, or `None` for unbounded channels.
    pub fn size(&self) -> Option<usize> {
        match self {
            Capacity::Rendezvous => Some(0),
            Capacity::Bounded(n) => Some(*n),
            Capacity::Unbounded => None,
        }
    }
}

pub struct Channel {
    name: SmolStr,
    capacity: Capacity,
    tx: Sender<Value>,
    rx: Receiver<Value>,
    closed: Latch,
}

/// Outcome of a blocking send that did not fail structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Delivered,
    TimedOut,
    Shutdown,
}

impl Channel {
    pub(crate) fn new(name: SmolStr, capacity: Capacity) -> Self {
        let (tx, rx) = match capacity {
            Capacity::Rendezvous => crossbeam_channel::bounded(0),
            Capacity::Bounded(n) => crossbeam_channel::bounded(n),
            Capacity::Unbounded => crossbeam_channel::unbounded(),
        };
        Self {
            name,
            capacity,
            tx,
            rx,
            closed: Latch::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Value> {
        &self.rx
    }

    pub(crate) fn closed_watch(&self) -> &Receiver<()> {
        self.closed.watch()
    }

    /// Enqueue `value`, blocking while the buffer is full.
    ///
    /// Fails with [`ChannelError::Closed`] if the channel is closed before or
    /// while waiting. A channel force-closed by shutdown reports
    /// [`SendOutcome::Shutdown`] instead.
    pub(crate) fn send(
        &self,
        value: Value,
        timeout: Duration,
        shutdown: &Latch,
    ) -> Result<SendOutcome, ChannelError> {
        if self.is_closed() {
            return self.closed_outcome(shutdown);
        }

        let mut sel = Select::new();
        let send_op = sel.send(&self.tx);
        let closed_op = sel.recv(self.closed.watch());
        sel.recv(shutdown.watch());

        let oper = match sel.select_timeout(timeout) {
            Ok(oper) => oper,
            Err(_) => return Ok(SendOutcome::TimedOut),
        };

        match oper.index() {
            i if i == send_op => {
                // Both endpoints live in `self`, so the send cannot disconnect
                oper.send(&self.tx, value)
                    .map_err(|_| ChannelError::Closed(self.name.clone()))?;
                Ok(SendOutcome::Delivered)
            }
            i if i == closed_op => {
                let _ = oper.recv(self.closed.watch());
                self.closed_outcome(shutdown)
            }
            _ => {
                let _ = oper.recv(shutdown.watch());
                Ok(SendOutcome::Shutdown)
            }
        }
    }

    /// Shutdown sets its latch before force-closing channels, so a closed
    /// channel seen with the latch set was closed by shutdown.
    fn closed_outcome(&self, shutdown: &Latch) -> Result<SendOutcome, ChannelError> {
        if shutdown.is_set() {
            Ok(SendOutcome::Shutdown)
        } else {
            Err(ChannelError::Closed(self.name.clone()))
        }
    }

    /// Dequeue the next value, blocking while the buffer is empty.
    ///
    /// Returns `None` on a closed channel, on timeout and on shutdown.
    pub(crate) fn receive(&self, timeout: Duration, shutdown: &Latch) -> Option<Value> {
        if self.is_closed() {
            return None;
        }

        let mut sel = Select::new();
        let recv_op = sel.recv(&self.rx);
        let closed_op = sel.recv(self.closed.watch());
        sel.recv(shutdown.watch());

        let oper = sel.select_timeout(timeout).ok()?;
        match oper.index() {
            i if i == recv_op => oper.recv(&self.rx).ok(),
            i if i == closed_op => {
                let _ = oper.recv(self.closed.watch());
                None
            }
            _ => {
                let _ = oper.recv(shutdown.watch());
                None
            }
        }
    }

    /// Mark the channel closed, wake every blocked operation and drop the
    /// buffered values.
    ///
    /// Returns `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        if !self.closed.set() {
            return false;
        }
        while self.rx.try_recv().is_ok() {}
        true
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(30);

    fn channel(capacity: Capacity) -> Channel {
        Channel::new(SmolStr::new("c"), capacity)
    }

    #[test]
    fn test_capacity_from_size() {
        assert_eq!(Capacity::from_size(0), Capacity::Rendezvous);
        assert_eq!(Capacity::from_size(4), Capacity::Bounded(4));
        assert_eq!(Capacity::Unbounded.size(), None);
    }

    #[test]
    fn test_bounded_blocks_when_full() {
        let shutdown = Latch::new();
        let ch = channel(Capacity::Bounded(2));

        assert_eq!(ch.send(Value::Int(1), SHORT, &shutdown).unwrap(), SendOutcome::Delivered);
        assert_eq!(ch.send(Value::Int(2), SHORT, &shutdown).unwrap(), SendOutcome::Delivered);
        assert_eq!(ch.send(Value::Int(3), SHORT, &shutdown).unwrap(), SendOutcome::TimedOut);
        assert_eq!(ch.len(), 2);
    }

    #[test]
    fn test_rendezvous_without_receiver_times_out() {
        let shutdown = Latch::new();
        let ch = channel(Capacity::Rendezvous);
        assert_eq!(ch.send(Value::Nil, SHORT, &shutdown).unwrap(), SendOutcome::TimedOut);
    }

    #[test]
    fn test_rendezvous_handoff() {
        let shutdown = Arc::new(Latch::new());
        let ch = Arc::new(channel(Capacity::Rendezvous));

        let receiver = {
            let ch = Arc::clone(&ch);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || ch.receive(Duration::from_secs(2), &shutdown))
        };

        let outcome = ch.send(Value::from("hi"), Duration::from_secs(2), &shutdown).unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(receiver.join().unwrap(), Some(Value::from("hi")));
    }

    #[test]
    fn test_receive_on_closed_is_immediate() {
        let shutdown = Latch::new();
        let ch = channel(Capacity::Bounded(1));
        ch.send(Value::Int(1), SHORT, &shutdown).unwrap();
        assert!(ch.close());

        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(ch.receive(Duration::from_secs(5), &shutdown), None);
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(ch.is_empty());
    }

    #[test]
    fn test_send_on_closed_fails() {
        let shutdown = Latch::new();
        let ch = channel(Capacity::Unbounded);
        ch.close();
        assert!(matches!(
            ch.send(Value::Nil, Duration::from_secs(5), &shutdown),
            Err(ChannelError::Closed(_))
        ));
        assert!(!ch.close());
    }

    #[test]
    fn test_close_wakes_blocked_sender() {
        let shutdown = Arc::new(Latch::new());
        let ch = Arc::new(channel(Capacity::Rendezvous));

        let sender = {
            let ch = Arc::clone(&ch);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || ch.send(Value::Int(1), Duration::from_secs(5), &shutdown))
        };

        thread::sleep(SHORT);
        ch.close();
        assert!(matches!(sender.join().unwrap(), Err(ChannelError::Closed(_))));
    }

    #[test]
    fn test_force_close_on_shutdown_is_not_an_error() {
        let shutdown = Arc::new(Latch::new());
        let ch = Arc::new(channel(Capacity::Rendezvous));

        let sender = {
            let ch = Arc::clone(&ch);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || ch.send(Value::Int(1), Duration::from_secs(5), &shutdown))
        };

        thread::sleep(SHORT);
        shutdown.set();
        ch.close();
        assert_eq!(sender.join().unwrap(), Ok(SendOutcome::Shutdown));
        assert_eq!(ch.send(Value::Int(2), SHORT, &shutdown), Ok(SendOutcome::Shutdown));
    }

    #[test]
    fn test_shutdown_wakes_blocked_receiver() {
        let shutdown = Arc::new(Latch::new());
        let ch = Arc::new(channel(Capacity::Bounded(1)));

        let receiver = {
            let ch = Arc::clone(&ch);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                let start = Instant::now();
                (ch.receive(Duration::from_secs(10), &shutdown), start.elapsed())
            })
        };

        thread::sleep(SHORT);
        shutdown.set();
        let (value, waited) = receiver.join().unwrap();
        assert_eq!(value, None);
        assert!(waited < Duration::from_secs(2));
    }
}
