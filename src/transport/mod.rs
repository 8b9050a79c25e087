//! Transport layer abstraction
//!
//! A [`Channel`] is the already-authenticated link between this client and
//! the relay. It moves whole frames and nothing else; the relay is trusted
//! to route honestly, while everything it carries from peers is not.
//!
//! # Design
//!
//! The channel is blocking with a bounded receive, so the background
//! receiver can notice a shutdown within one timeout interval.

use std::time::Duration;

use thiserror::Error;

pub mod memory;

pub use memory::{create_pair, MemoryChannel, MemoryRelay, RelayChannel};

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The other end went away
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),
}

/// Result type for transport operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// One unit received from the channel
///
/// `declared_len` is what the sender's length prefix claimed. A frame whose
/// declared length differs from the payload it carried means the relay is
/// lying, which the session treats as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Length announced on the wire
    pub declared_len: u64,
    /// Bytes actually delivered
    pub payload: Vec<u8>,
}

impl Frame {
    /// A frame whose declared length matches its payload
    pub fn new(payload: Vec<u8>) -> Self {
        Frame {
            declared_len: payload.len() as u64,
            payload,
        }
    }

    /// Whether the declared length matches the payload
    pub fn is_consistent(&self) -> bool {
        self.declared_len == self.payload.len() as u64
    }
}

/// Abstract channel trait
///
/// Implementations only move bytes. Exclusive use is arranged by the
/// caller, so methods take `&mut self`.
pub trait Channel: Send {
    /// Send one frame
    fn send(&mut self, data: &[u8]) -> ChannelResult<()>;

    /// Wait up to `timeout` for one frame
    ///
    /// `Ok(None)` means the timeout passed with nothing to read.
    fn receive(&mut self, timeout: Duration) -> ChannelResult<Option<Frame>>;

    /// Whether the channel has failed and can no longer be used
    fn is_broken(&self) -> bool;
}
