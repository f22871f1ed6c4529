//! # Multiplexed receive over named channels
//!
//! [`ChannelRegistry::select`] waits on several channels at once and
//! reports which one fired. It builds a dynamic crossbeam `Select` with, per
//! candidate channel, a receive on its buffer and a receive on its closed
//! latch, plus one receive on the registry's shutdown latch.
//!
//! When several operations are ready at the same time crossbeam picks one at
//! random, so ties between channels are broken uniformly rather than by
//! argument order.
//!
//! ```rust
//! use weave_channel::{ChannelRegistry, Selected, Value};
//!
//! let registry = ChannelRegistry::new();
//! registry.create("jobs", 4).unwrap();
//! registry.create("events", 4).unwrap();
//! registry.send("events", Value::Int(1)).unwrap();
//!
//! match registry.select(&["jobs", "events"]).unwrap() {
//!     Selected::Value { channel, value } => {
//!         assert_eq!(channel, "events");
//!         assert_eq!(value, Value::Int(1));
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Select;
use smol_str::SmolStr;
use tracing::trace;

use crate::channel::Channel;
use crate::registry::ChannelRegistry;
use crate::value::Value;
use crate::ChannelError;

/// The result of a select.
#[derive(Debug, Clone, PartialEq)]
pub enum Selected {
    /// A value was received from `channel`.
    Value { channel: SmolStr, value: Value },
    /// `channel` was observed closed.
    Closed { channel: SmolStr },
    /// The registry shut down while waiting.
    Shutdown,
    /// The deadline passed without any candidate becoming ready.
    Timeout,
}

impl Selected {
    /// The winning channel, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Selected::Value { channel, .. } | Selected::Closed { channel } => {
                Some(channel.as_str())
            }
            Selected::Shutdown | Selected::Timeout => None,
        }
    }

    /// The received value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Selected::Value { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Selected::Value { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Selected::Value { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Selected::Closed { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Selected::Shutdown)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Selected::Timeout)
    }
}

/// What a registered select operation stands for.
enum Arm<'a> {
    Data(&'a Channel),
    Closed(&'a Channel),
}

impl ChannelRegistry {
    /// Block until one of `names` yields a value or is closed, or until
    /// shutdown.
    ///
    /// Unknown names are ignored; the call fails only if none of them
    /// resolve to a channel.
    pub fn select(&self, names: &[&str]) -> Result<Selected, ChannelError> {
        self.select_inner(names, None)
    }

    /// Like [`select`](Self::select), returning [`Selected::Timeout`] if
    /// nothing is ready within `timeout`.
    pub fn select_timeout(
        &self,
        names: &[&str],
        timeout: Duration,
    ) -> Result<Selected, ChannelError> {
        self.select_inner(names, Some(timeout))
    }

    fn select_inner(
        &self,
        names: &[&str],
        timeout: Option<Duration>,
    ) -> Result<Selected, ChannelError> {
        self.ensure_running()?;

        let candidates: Vec<Arc<Channel>> = {
            let channels = self.channels.read();
            names
                .iter()
                .filter_map(|name| channels.get(*name).cloned())
                .collect()
        };
        if candidates.is_empty() {
            return Err(ChannelError::NoCandidates);
        }

        let mut sel = Select::new();
        let mut arms = Vec::with_capacity(candidates.len() * 2);
        for channel in &candidates {
            // A closed channel only contributes its closed signal
            if !channel.is_closed() {
                let index = sel.recv(channel.receiver());
                arms.push((index, Arm::Data(channel.as_ref())));
            }
            let index = sel.recv(channel.closed_watch());
            arms.push((index, Arm::Closed(channel.as_ref())));
        }
        let shutdown_op = sel.recv(self.shutdown.watch());

        let oper = match timeout {
            Some(timeout) => match sel.select_timeout(timeout) {
                Ok(oper) => oper,
                Err(_) => return Ok(Selected::Timeout),
            },
            None => sel.select(),
        };

        let index = oper.index();
        if index == shutdown_op {
            let _ = oper.recv(self.shutdown.watch());
            return Ok(Selected::Shutdown);
        }

        let arm = arms
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, arm)| arm);

        let selected = match arm {
            Some(Arm::Data(channel)) => match oper.recv(channel.receiver()) {
                Ok(value) => Selected::Value {
                    channel: SmolStr::new(channel.name()),
                    value,
                },
                Err(_) => self.closed_signal(channel),
            },
            Some(Arm::Closed(channel)) => {
                let _ = oper.recv(channel.closed_watch());
                self.closed_signal(channel)
            }
            // Every index handed out by `sel` is recorded in `arms`
            None => {
                let _ = oper.recv(self.shutdown.watch());
                Selected::Shutdown
            }
        };

        trace!(channel = ?selected.channel(), "select");
        Ok(selected)
    }

    /// Shutdown force-closes every channel after setting its latch; a closed
    /// channel seen with the latch set reports the shutdown.
    fn closed_signal(&self, channel: &Channel) -> Selected {
        if self.shutdown.is_set() {
            Selected::Shutdown
        } else {
            Selected::Closed {
                channel: SmolStr::new(channel.name()),
            }
        }
    }
}
