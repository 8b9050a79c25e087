//! Friend records and the friend registry
//!
//! A [`Friend`] exists only after a completed handshake. It owns the
//! [`KeyQuadruple`] agreed with that peer; the keys are wiped when the
//! record is dropped.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::cipher::KEY_SIZE;
use crate::crypto::{random_bytes, CryptoResult, Fingerprint, PublicKey, Uid};

pub mod notify;

pub use notify::{NotificationEvent, NotificationQueue, NotificationSink};

/// Key material carried in an accepted friend request
pub const KEY_MATERIAL_LEN: usize = 4 * KEY_SIZE;

/// Friend registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A friend with this uid already exists
    #[error("Friend {0} already exists")]
    Duplicate(Uid),

    /// No friend with this uid
    #[error("No friend {0}")]
    NotFound(Uid),

    /// The backing store failed
    #[error("Friend store failure: {0}")]
    Backend(String),
}

/// The four per-direction secrets shared with one friend
///
/// Both sides derive theirs from the same 128 bytes chosen by the
/// responder. The requester swaps the halves, so each side's send keys
/// are the other side's receive keys.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyQuadruple {
    /// Encrypts what we send
    pub send_symm: [u8; KEY_SIZE],
    /// Authenticates what we send
    pub send_hmac: [u8; KEY_SIZE],
    /// Decrypts what we receive
    pub recv_symm: [u8; KEY_SIZE],
    /// Authenticates what we receive
    pub recv_hmac: [u8; KEY_SIZE],
    /// Next outbound message counter
    pub send_nonce: u64,
    /// Next expected inbound message counter
    pub recv_nonce: u64,
}

impl KeyQuadruple {
    /// Keys for the side that generated `material` and accepted the request
    pub fn for_responder(material: &[u8; KEY_MATERIAL_LEN]) -> Self {
        let parts = split_material(material);
        KeyQuadruple {
            send_symm: parts[0],
            send_hmac: parts[1],
            recv_symm: parts[2],
            recv_hmac: parts[3],
            send_nonce: 0,
            recv_nonce: 0,
        }
    }

    /// Keys for the side that sent the request and received `material`
    pub fn for_requester(material: &[u8; KEY_MATERIAL_LEN]) -> Self {
        let parts = split_material(material);
        KeyQuadruple {
            recv_symm: parts[0],
            recv_hmac: parts[1],
            send_symm: parts[2],
            send_hmac: parts[3],
            send_nonce: 0,
            recv_nonce: 0,
        }
    }
}

fn split_material(material: &[u8; KEY_MATERIAL_LEN]) -> Zeroizing<[[u8; KEY_SIZE]; 4]> {
    let mut out = Zeroizing::new([[0u8; KEY_SIZE]; 4]);
    for (key, chunk) in out.iter_mut().zip(material.chunks_exact(KEY_SIZE)) {
        key.copy_from_slice(chunk);
    }
    out
}

impl std::fmt::Debug for KeyQuadruple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyQuadruple")
            .field("send_nonce", &self.send_nonce)
            .field("recv_nonce", &self.recv_nonce)
            .finish_non_exhaustive()
    }
}

/// A user we completed a handshake with
#[derive(Clone)]
pub struct Friend {
    /// `SHA256(username ++ 0x00)`
    pub uid: Uid,
    /// Their username
    pub username: String,
    /// Their long-term key, as verified during the handshake
    pub public_key: PublicKey,
    /// Secrets shared with them
    pub keys: KeyQuadruple,
    /// Random name of the local conversation log
    pub conversation_id: [u8; 32],
}

impl Friend {
    /// Create a friend record with a fresh conversation id
    pub fn new(username: &str, public_key: PublicKey, keys: KeyQuadruple) -> CryptoResult<Self> {
        let conversation_id = *random_bytes::<32>()?;
        Ok(Friend {
            uid: Uid::from_username(username),
            username: username.to_string(),
            public_key,
            keys,
            conversation_id,
        })
    }
}

impl std::fmt::Debug for Friend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Friend")
            .field("uid", &self.uid)
            .field("username", &self.username)
            .field("public_key", &self.public_key)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// An authenticated friend request waiting for the user's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFriendRequest {
    /// Requester's username
    pub username: String,
    /// Requester's long-term key, which signed the request
    pub public_key: PublicKey,
}

impl PendingFriendRequest {
    /// Requester's uid
    pub fn uid(&self) -> Uid {
        Uid::from_username(&self.username)
    }

    /// Requester's key fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        self.public_key.fingerprint()
    }
}

/// Friend persistence
pub trait FriendStore: Send + Sync {
    /// Add a friend; a uid may only be present once
    fn append(&self, friend: Friend) -> Result<(), StoreError>;

    /// Whether a friend with `uid` exists
    fn contains(&self, uid: &Uid) -> bool;

    /// Look up a friend
    fn get(&self, uid: &Uid) -> Option<Friend>;

    /// Remove and return a friend
    fn remove(&self, uid: &Uid) -> Result<Friend, StoreError>;

    /// All friends in insertion order
    fn list(&self) -> Vec<Friend>;
}

/// In-memory friend registry
#[derive(Default)]
pub struct MemoryFriendStore {
    friends: Mutex<Vec<Friend>>,
}

impl MemoryFriendStore {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Friend>> {
        self.friends.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FriendStore for MemoryFriendStore {
    fn append(&self, friend: Friend) -> Result<(), StoreError> {
        let mut friends = self.lock();
        if friends.iter().any(|f| f.uid == friend.uid) {
            return Err(StoreError::Duplicate(friend.uid));
        }
        friends.push(friend);
        Ok(())
    }

    fn contains(&self, uid: &Uid) -> bool {
        self.lock().iter().any(|f| f.uid == *uid)
    }

    fn get(&self, uid: &Uid) -> Option<Friend> {
        self.lock().iter().find(|f| f.uid == *uid).cloned()
    }

    fn remove(&self, uid: &Uid) -> Result<Friend, StoreError> {
        let mut friends = self.lock();
        let index = friends
            .iter()
            .position(|f| f.uid == *uid)
            .ok_or(StoreError::NotFound(*uid))?;
        Ok(friends.remove(index))
    }

    fn list(&self) -> Vec<Friend> {
        self.lock().clone()
    }
}
