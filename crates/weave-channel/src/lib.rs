//! # Weave Channel
//!
//! Named channels for passing values between concurrently running script
//! tasks.
//!
//! Scripts refer to channels by name, so this crate is organised around a
//! [`ChannelRegistry`] rather than around sender/receiver handles:
//!
//! - [`ChannelRegistry::create`] - create a buffered (or rendezvous) channel
//! - [`ChannelRegistry::send`] / [`ChannelRegistry::receive`] - blocking with
//!   a timeout; a timeout is a result, not an error
//! - [`ChannelRegistry::select`] - wait on several channels at once
//! - [`ChannelRegistry::close`] - close a channel and wake its waiters
//! - [`ChannelRegistry::shutdown`] - unblock everything and refuse new work
//!
//! ## Example
//!
//! ```rust
//! use weave_channel::{ChannelRegistry, Value};
//! use std::time::Duration;
//!
//! let registry = ChannelRegistry::new();
//! registry.create("c", 1).unwrap();
//!
//! assert!(registry.send("c", Value::from("x")).unwrap());
//! // Buffer is full: the second send is not delivered
//! assert!(!registry.send_timeout("c", Value::from("y"), Duration::from_millis(100)).unwrap());
//!
//! assert_eq!(registry.receive("c").unwrap(), Some(Value::from("x")));
//! assert!(registry.send("c", Value::from("y")).unwrap());
//! ```

pub mod channel;
pub mod latch;
pub mod registry;
pub mod select;
pub mod value;

use smol_str::SmolStr;
use thiserror::Error;

pub use channel::{Capacity, Channel};
pub use latch::Latch;
pub use registry::{
    ChannelRegistry, DEFAULT_CLOSED_LIMIT, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_SEND_TIMEOUT,
};
pub use select::Selected;
pub use value::Value;

// ============================================================================
// Error Types
// ============================================================================

/// Structural errors of channel operations.
///
/// Timeouts are never reported through this type; blocking operations
/// return a "not completed" result instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// No channel with this name exists.
    #[error("channel {0} does not exist")]
    NotFound(SmolStr),

    /// An open channel with this name already exists.
    #[error("channel {0} already exists")]
    AlreadyExists(SmolStr),

    /// The channel is closed and cannot accept values.
    #[error("channel {0} is closed")]
    Closed(SmolStr),

    /// The channel was closed before.
    #[error("channel {0} is already closed")]
    AlreadyClosed(SmolStr),

    /// None of the names given to select refer to a channel.
    #[error("no valid channels provided")]
    NoCandidates,

    /// The registry has been shut down.
    #[error("channel registry has been shut down")]
    Shutdown,
}

impl ChannelError {
    /// The channel this error refers to, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            ChannelError::NotFound(name)
            | ChannelError::AlreadyExists(name)
            | ChannelError::Closed(name)
            | ChannelError::AlreadyClosed(name) => Some(name.as_str()),
            ChannelError::NoCandidates | ChannelError::Shutdown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ChannelError::NotFound("jobs".into()).to_string(),
            "channel jobs does not exist"
        );
        assert_eq!(
            ChannelError::AlreadyClosed("jobs".into()).to_string(),
            "channel jobs is already closed"
        );
        assert_eq!(ChannelError::NoCandidates.to_string(), "no valid channels provided");
    }

    #[test]
    fn test_error_channel_name() {
        assert_eq!(ChannelError::Closed("c".into()).channel(), Some("c"));
        assert_eq!(ChannelError::Shutdown.channel(), None);
    }
}
