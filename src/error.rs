//! Crate-level error type

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::friends::StoreError;
use crate::session::ModeError;
use crate::transport::ChannelError;

/// Errors surfaced by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session has stopped and accepts no more work
    #[error("Session stopped")]
    Stopped,

    /// The channel to the relay failed
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The relay sent something it never should
    #[error("Relay protocol violation: {0}")]
    RelayViolation(String),

    /// A local cryptographic operation failed
    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    /// A public-key lookup is already outstanding
    #[error("A public-key lookup is already in flight")]
    LookupInFlight,

    /// The relay did not answer a lookup in time
    #[error("Timed out waiting for lookup reply")]
    LookupTimedOut,

    /// Friend persistence failed
    #[error("Friend store error: {0}")]
    Store(#[from] StoreError),

    /// The user is already a friend
    #[error("Already friends with {0}")]
    AlreadyFriends(String),

    /// The background receiver could not be started
    #[error("Failed to start receiver thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl SessionError {
    /// Whether this error ends the session
    ///
    /// Channel failures, relay misbehaviour and RNG failure are fatal.
    /// Everything else fails only the operation that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Stopped
                | SessionError::Channel(_)
                | SessionError::RelayViolation(_)
                | SessionError::Crypto(CryptoError::RngError)
        )
    }
}

impl From<ModeError> for SessionError {
    fn from(err: ModeError) -> Self {
        match err {
            ModeError::Stopped => SessionError::Stopped,
            ModeError::LookupInFlight => SessionError::LookupInFlight,
            ModeError::TimedOut => SessionError::LookupTimedOut,
            ModeError::Unsolicited | ModeError::MailboxFull => {
                SessionError::RelayViolation(err.to_string())
            }
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
