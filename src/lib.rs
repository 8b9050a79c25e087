//! # relaychat
//!
//! Client core of a relay-routed end-to-end messenger.
//!
//! Clients keep one authenticated connection to an untrusted relay. The
//! relay answers public-key lookups and forwards opaque frames between
//! users; it never sees plaintext. Two users become friends through a
//! signed, encrypted handshake that ends with both sides holding the same
//! four symmetric keys.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relaychat::{
//!     FriendRequestEngine, Identity, MemoryFriendStore, MemoryRelay,
//!     NotificationQueue, Session, SessionConfig,
//! };
//!
//! let relay = MemoryRelay::new();
//! let alice = Identity::generate("alice", 2048).unwrap();
//! let channel = relay.register("alice", alice.public_key().clone());
//!
//! let session = Arc::new(Session::new(
//!     alice,
//!     SessionConfig::default(),
//!     Box::new(channel),
//!     Arc::new(MemoryFriendStore::new()),
//!     Arc::new(NotificationQueue::new()),
//! ));
//! let engine = FriendRequestEngine::start(session).unwrap();
//! let confirm = |_: &str, fp: &relaychat::Fingerprint| {
//!     println!("bob's fingerprint: {}", fp);
//!     true
//! };
//! engine.send_friend_request("bob", &confirm).unwrap();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              APPLICATION LAYER              │
//! │      CLI  |  FriendRequestEngine  |  UI     │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               SESSION LAYER                 │
//! │  ModeRegister | ConnectionArbiter | Friends │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │              PROTOCOL LAYER                 │
//! │   Outer frames | Lookup | Secure envelope   │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               CRYPTO LAYER                  │
//! │  RSA-OAEP/PSS | ChaCha20 | HMAC-SHA256      │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │             TRANSPORT LAYER                 │
//! │        Channel trait | in-memory relay      │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod friendreq;
pub mod friends;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export main types at crate root
pub use config::{ConfigError, SessionConfig};
pub use crypto::{random_bytes, CryptoError, CryptoResult, Fingerprint, Identity, PublicKey, Uid};
pub use error::{SessionError, SessionResult};
pub use friendreq::{FingerprintVerifier, FriendRequestEngine, RequestOutcome};
pub use friends::{
    Friend, FriendStore, KeyQuadruple, MemoryFriendStore, NotificationEvent, NotificationQueue,
    NotificationSink, PendingFriendRequest, StoreError,
};
pub use protocol::{InnerKind, LookupOutcome, Parsed, Rejection};
pub use session::{ConnectionArbiter, InboundHandler, Mode, ModeRegister, Session};
pub use transport::{Channel, ChannelError, Frame, MemoryRelay};
