//! Friend-request protocol engine
//!
//! Outbound, a request runs:
//!
//! ```text
//! lookup(uid) --> relay --> key or not-found
//!     |
//!     v
//! fingerprint shown to the user --no--> canceled
//!     | yes
//!     v
//! kind 1 envelope --> peer ... kind 2 envelope with 128 key bytes --> Friend
//! ```
//!
//! Inbound, a valid kind 1 becomes a [`PendingFriendRequest`] notification.
//! Accepting it draws the 128 key bytes, answers with kind 2 and stores the
//! friend. Anything that fails validation is dropped without a reply, so a
//! peer cannot use us to test envelopes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{random_bytes, Fingerprint, PublicKey, Uid};
use crate::error::{SessionError, SessionResult};
use crate::friends::{
    Friend, KeyQuadruple, NotificationEvent, PendingFriendRequest, KEY_MATERIAL_LEN,
};
use crate::protocol::frame::{encode_lookup_request, encode_routed, parse_lookup_reply};
use crate::protocol::{
    make_secure_envelope, parse_secure_envelope, InnerKind, LookupOutcome, Parsed,
};
use crate::session::{InboundHandler, Session};

/// Out-of-band check of a peer's key fingerprint
///
/// This is the only thing that ties a username to a key; the relay could
/// otherwise hand out any key it likes.
pub trait FingerprintVerifier {
    /// Return true if the user confirms `fingerprint` belongs to `username`
    fn confirm(&self, username: &str, fingerprint: &Fingerprint) -> bool;
}

impl<F> FingerprintVerifier for F
where
    F: Fn(&str, &Fingerprint) -> bool,
{
    fn confirm(&self, username: &str, fingerprint: &Fingerprint) -> bool {
        self(username, fingerprint)
    }
}

/// How an outbound friend request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The request envelope was sent
    Sent,
    /// The relay does not know the user
    NotFound,
    /// The user declined the fingerprint
    Canceled,
}

/// Drives friend requests for one session
pub struct FriendRequestEngine {
    session: Arc<Session>,
    // Requests we sent and the key the user approved for each
    outbound: Mutex<HashMap<Uid, PublicKey>>,
    // Held from the duplicate check until the friend is stored
    accepting: Mutex<()>,
}

impl FriendRequestEngine {
    /// Create an engine without starting the receiver
    pub fn new(session: Arc<Session>) -> Self {
        FriendRequestEngine {
            session,
            outbound: Mutex::new(HashMap::new()),
            accepting: Mutex::new(()),
        }
    }

    /// Create an engine and start the session's receiver with it
    pub fn start(session: Arc<Session>) -> SessionResult<Arc<Self>> {
        let engine = Arc::new(Self::new(session));
        engine.session.start_receiver(engine.clone())?;
        Ok(engine)
    }

    /// The session this engine drives
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Ask the relay for `username`'s public key
    ///
    /// Only one lookup may be outstanding per session; a second caller
    /// gets [`SessionError::LookupInFlight`].
    pub fn request_pubkey(&self, username: &str) -> SessionResult<LookupOutcome> {
        let uid = Uid::from_username(username);
        let mode = self.session.mode();

        mode.begin_lookup()?;
        let result = self.lookup(&uid);
        mode.end_lookup();

        result.map_err(|e| self.session.fail(e))
    }

    fn lookup(&self, uid: &Uid) -> SessionResult<LookupOutcome> {
        self.session.arbiter().send(&encode_lookup_request(uid))?;
        let reply = self
            .session
            .mode()
            .wait_reply(self.session.config().lookup_timeout())?;

        parse_lookup_reply(&reply, uid)
            .map_err(|e| SessionError::RelayViolation(format!("bad lookup reply: {}", e)))
    }

    /// Look up `username`, have the user confirm the key, and send a request
    pub fn send_friend_request(
        &self,
        username: &str,
        verifier: &dyn FingerprintVerifier,
    ) -> SessionResult<RequestOutcome> {
        let uid = Uid::from_username(username);
        if self.session.friends().contains(&uid) {
            return Err(SessionError::AlreadyFriends(username.to_string()));
        }

        let key = match self.request_pubkey(username)? {
            LookupOutcome::Found(key) => key,
            LookupOutcome::NotFound => {
                info!(user = username, "friend request target not found");
                return Ok(RequestOutcome::NotFound);
            }
        };

        let fingerprint = key.fingerprint();
        if !verifier.confirm(username, &fingerprint) {
            info!(user = username, "friend request canceled at fingerprint check");
            return Ok(RequestOutcome::Canceled);
        }

        let envelope =
            make_secure_envelope(InnerKind::FriendRequest, self.session.identity(), &key, &[])
                .map_err(|e| self.session.fail(e.into()))?;

        // Recorded before sending so a quick answer is recognised
        self.outbound().insert(uid, key);
        if let Err(err) = self.session.send(&encode_routed(&uid, &envelope)) {
            self.outbound().remove(&uid);
            return Err(err);
        }

        info!(user = username, fingerprint = %fingerprint, "friend request sent");
        Ok(RequestOutcome::Sent)
    }

    /// Accept a pending request: answer with fresh keys and store the friend
    ///
    /// Concurrent accepts are serialized so only one set of keys is ever
    /// sent to the requester.
    pub fn accept(&self, pending: &PendingFriendRequest) -> SessionResult<Friend> {
        let _accepting = self.accepting.lock().unwrap_or_else(PoisonError::into_inner);
        let uid = pending.uid();
        if self.session.friends().contains(&uid) {
            return Err(SessionError::AlreadyFriends(pending.username.clone()));
        }

        self.respond(pending, &uid).map_err(|e| self.session.fail(e))
    }

    fn respond(&self, pending: &PendingFriendRequest, uid: &Uid) -> SessionResult<Friend> {
        let material = random_bytes::<KEY_MATERIAL_LEN>()?;
        let envelope = make_secure_envelope(
            InnerKind::FriendResponse,
            self.session.identity(),
            &pending.public_key,
            &material[..],
        )?;

        let keys = KeyQuadruple::for_responder(&material);
        let friend = Friend::new(&pending.username, pending.public_key.clone(), keys)?;

        self.session.send(&encode_routed(uid, &envelope))?;
        self.session.friends().append(friend.clone())?;

        info!(user = %pending.username, "friend request accepted");
        self.session.notify(NotificationEvent::FriendAdded(friend.clone()));
        Ok(friend)
    }

    /// Decline a pending request; nothing is sent
    pub fn reject(&self, pending: PendingFriendRequest) {
        info!(user = %pending.username, "friend request rejected");
    }

    /// Remove a friend and wipe the keys shared with them
    pub fn unfriend(&self, uid: &Uid) -> SessionResult<()> {
        let friend = self.session.friends().remove(uid)?;
        self.outbound().remove(uid);
        info!(user = %friend.username, "friend removed");
        Ok(())
    }

    fn on_conversation(&self, sender: Uid, body: &[u8]) -> SessionResult<()> {
        if !self.session.friends().contains(&sender) {
            debug!(sender = %sender, "dropping message from non-friend");
            return Ok(());
        }
        self.session.notify(NotificationEvent::Message {
            from: sender,
            body: body.to_vec(),
        });
        Ok(())
    }

    fn on_friend_request(&self, sender: Uid, body: &[u8]) -> SessionResult<()> {
        if self.session.friends().contains(&sender) {
            debug!(sender = %sender, "dropping friend request from existing friend");
            return Ok(());
        }

        let fields = match parse_secure_envelope(body, self.session.identity())? {
            Parsed::Valid(fields) => fields,
            Parsed::Invalid(why) => {
                debug!(sender = %sender, reason = ?why, "dropping invalid friend request");
                return Ok(());
            }
        };
        if Uid::from_username(&fields.username) != sender {
            debug!(sender = %sender, "dropping friend request with mismatched sender");
            return Ok(());
        }
        if !fields.extra.is_empty() {
            debug!(sender = %sender, "dropping friend request with trailing data");
            return Ok(());
        }

        info!(
            user = %fields.username,
            fingerprint = %fields.public_key.fingerprint(),
            "friend request received"
        );
        self.session
            .notify(NotificationEvent::FriendRequest(PendingFriendRequest {
                username: fields.username.clone(),
                public_key: fields.public_key.clone(),
            }));
        Ok(())
    }

    fn on_friend_response(&self, sender: Uid, body: &[u8]) -> SessionResult<()> {
        let fields = match parse_secure_envelope(body, self.session.identity())? {
            Parsed::Valid(fields) => fields,
            Parsed::Invalid(why) => {
                debug!(sender = %sender, reason = ?why, "dropping invalid friend response");
                return Ok(());
            }
        };
        if Uid::from_username(&fields.username) != sender {
            debug!(sender = %sender, "dropping friend response with mismatched sender");
            return Ok(());
        }
        if fields.extra.len() != KEY_MATERIAL_LEN {
            debug!(
                sender = %sender,
                len = fields.extra.len(),
                "dropping friend response with bad key length"
            );
            return Ok(());
        }

        {
            let mut outbound = self.outbound();
            match outbound.get(&sender) {
                Some(approved) if *approved == fields.public_key => {
                    outbound.remove(&sender);
                }
                Some(_) => {
                    warn!(
                        sender = %sender,
                        "friend response signed by a key the user did not approve"
                    );
                    return Ok(());
                }
                None => {
                    debug!(sender = %sender, "dropping unsolicited friend response");
                    return Ok(());
                }
            }
        }

        if self.session.friends().contains(&sender) {
            debug!(sender = %sender, "dropping friend response for existing friend");
            return Ok(());
        }

        let mut material = Zeroizing::new([0u8; KEY_MATERIAL_LEN]);
        material.copy_from_slice(&fields.extra);
        let keys = KeyQuadruple::for_requester(&material);
        let friend = Friend::new(&fields.username, fields.public_key.clone(), keys)?;
        self.session.friends().append(friend.clone())?;

        info!(user = %fields.username, "friend added");
        self.session.notify(NotificationEvent::FriendAdded(friend));
        Ok(())
    }

    fn outbound(&self) -> MutexGuard<'_, HashMap<Uid, PublicKey>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InboundHandler for FriendRequestEngine {
    fn handle_routed(&self, sender: Uid, body: &[u8]) -> SessionResult<()> {
        let Some(&kind) = body.first() else {
            debug!(sender = %sender, "dropping empty body");
            return Ok(());
        };
        match InnerKind::try_from(kind) {
            Ok(InnerKind::Conversation) => self.on_conversation(sender, body),
            Ok(InnerKind::FriendRequest) => self.on_friend_request(sender, body),
            Ok(InnerKind::FriendResponse) => self.on_friend_response(sender, body),
            Err(kind) => {
                debug!(sender = %sender, kind, "dropping body of unknown kind");
                Ok(())
            }
        }
    }
}
