//! In-process channels
//!
//! [`create_pair`] gives two raw endpoints; a test holding one end plays
//! the relay and can inject arbitrary frames. [`MemoryRelay`] is a small
//! store-and-forward relay with a user directory, good enough to run two
//! clients against each other.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use super::{Channel, ChannelError, ChannelResult, Frame};
use crate::crypto::{PublicKey, Uid};
use crate::protocol::frame::{self, OUTER_LOOKUP, OUTER_ROUTED};

/// Create a pair of connected in-memory channels
pub fn create_pair() -> (MemoryChannel, MemoryChannel) {
    let (tx1, rx1) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    let channel1 = MemoryChannel {
        tx: tx1,
        rx: rx2,
        broken: false,
    };

    let channel2 = MemoryChannel {
        tx: tx2,
        rx: rx1,
        broken: false,
    };

    (channel1, channel2)
}

/// In-memory channel endpoint
pub struct MemoryChannel {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    broken: bool,
}

impl MemoryChannel {
    /// Send a frame as-is, including a declared length that may be a lie
    pub fn send_frame(&mut self, frame: Frame) -> ChannelResult<()> {
        if self.broken {
            return Err(ChannelError::Disconnected);
        }
        self.tx.send(frame).map_err(|_| {
            self.broken = true;
            ChannelError::Disconnected
        })
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        self.send_frame(Frame::new(data.to_vec()))
    }

    fn receive(&mut self, timeout: Duration) -> ChannelResult<Option<Frame>> {
        if self.broken {
            return Err(ChannelError::Disconnected);
        }
        recv_timeout(&self.rx, timeout, &mut self.broken)
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

fn recv_timeout(
    rx: &Receiver<Frame>,
    timeout: Duration,
    broken: &mut bool,
) -> ChannelResult<Option<Frame>> {
    match rx.recv_timeout(timeout) {
        Ok(frame) => Ok(Some(frame)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => {
            *broken = true;
            Err(ChannelError::Disconnected)
        }
    }
}

struct DirectoryEntry {
    public_key: PublicKey,
    inbox: Option<Sender<Frame>>,
}

#[derive(Default)]
struct RelayState {
    users: HashMap<Uid, DirectoryEntry>,
}

/// Simulated relay server
///
/// Answers public-key lookups from its directory and forwards routed
/// frames, rewriting the target uid to the sender's uid. Frames for users
/// who are registered but offline are dropped.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `username` with `public_key` and connect them
    ///
    /// Registering again replaces the previous connection.
    pub fn register(&self, username: &str, public_key: PublicKey) -> RelayChannel {
        let uid = Uid::from_username(username);
        let (tx, rx) = mpsc::channel();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.users.insert(
            uid,
            DirectoryEntry {
                public_key,
                inbox: Some(tx),
            },
        );

        RelayChannel {
            uid,
            relay: self.clone(),
            rx,
            broken: false,
        }
    }

    /// Drop a user's connection; their channel reports a hard error
    pub fn disconnect(&self, username: &str) {
        let uid = Uid::from_username(username);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = state.users.get_mut(&uid) {
            entry.inbox = None;
        }
    }

    fn handle(&self, from: &Uid, data: &[u8]) -> ChannelResult<()> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let reply_to = state
            .users
            .get(from)
            .and_then(|e| e.inbox.as_ref())
            .ok_or(ChannelError::Disconnected)?;

        match data.first() {
            Some(&OUTER_LOOKUP) => {
                let target = frame::decode_lookup_request(data)
                    .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
                let reply = match state.users.get(&target) {
                    Some(entry) => frame::encode_lookup_found(&target, &entry.public_key),
                    None => frame::encode_not_found(),
                };
                debug!(uid = %target, "relay answered lookup");
                reply_to
                    .send(Frame::new(reply))
                    .map_err(|_| ChannelError::Disconnected)
            }
            Some(&OUTER_ROUTED) => {
                let (target, body) = frame::decode_routed(data)
                    .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
                match state.users.get(&target).and_then(|e| e.inbox.as_ref()) {
                    Some(inbox) => {
                        let forwarded = frame::encode_routed(from, body);
                        // A receiver that hung up is the same as offline
                        let _ = inbox.send(Frame::new(forwarded));
                    }
                    None => debug!(uid = %target, "relay dropped frame for offline user"),
                }
                Ok(())
            }
            Some(other) => Err(ChannelError::SendFailed(format!(
                "unknown frame type {:#04x}",
                other
            ))),
            None => Err(ChannelError::SendFailed("empty frame".to_string())),
        }
    }
}

/// A client's connection to a [`MemoryRelay`]
pub struct RelayChannel {
    uid: Uid,
    relay: MemoryRelay,
    rx: Receiver<Frame>,
    broken: bool,
}

impl RelayChannel {
    /// Uid this connection is registered as
    pub fn uid(&self) -> Uid {
        self.uid
    }
}

impl Channel for RelayChannel {
    fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        if self.broken {
            return Err(ChannelError::Disconnected);
        }
        self.relay.handle(&self.uid, data).inspect_err(|e| {
            if *e == ChannelError::Disconnected {
                self.broken = true;
            }
        })
    }

    fn receive(&mut self, timeout: Duration) -> ChannelResult<Option<Frame>> {
        if self.broken {
            return Err(ChannelError::Disconnected);
        }
        recv_timeout(&self.rx, timeout, &mut self.broken)
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{parse_lookup_reply, LookupOutcome};
    use crate::test_support::{alice, bob};

    const WAIT: Duration = Duration::from_millis(200);

    #[test]
    fn test_memory_pair() {
        let (mut a, mut b) = create_pair();

        a.send(b"Hello Bob").unwrap();
        let received = b.receive(WAIT).unwrap().unwrap();
        assert_eq!(received.payload, b"Hello Bob");
        assert!(received.is_consistent());

        assert_eq!(a.receive(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_memory_pair_lying_frame() {
        let (mut a, mut b) = create_pair();
        a.send_frame(Frame {
            declared_len: 99,
            payload: vec![0; 3],
        })
        .unwrap();
        assert!(!b.receive(WAIT).unwrap().unwrap().is_consistent());
    }

    #[test]
    fn test_memory_pair_hangup_breaks_channel() {
        let (mut a, b) = create_pair();
        drop(b);

        assert_eq!(a.receive(WAIT), Err(ChannelError::Disconnected));
        assert!(a.is_broken());
        assert!(a.send(b"late").is_err());
    }

    #[test]
    fn test_relay_lookup() {
        let relay = MemoryRelay::new();
        let mut a = relay.register("alice", alice().public_key().clone());
        relay.register("bob", bob().public_key().clone());

        let bob_uid = Uid::from_username("bob");
        a.send(&frame::encode_lookup_request(&bob_uid)).unwrap();
        let reply = a.receive(WAIT).unwrap().unwrap();
        assert_eq!(
            parse_lookup_reply(&reply.payload, &bob_uid).unwrap(),
            LookupOutcome::Found(bob().public_key().clone())
        );

        let nobody = Uid::from_username("nobody");
        a.send(&frame::encode_lookup_request(&nobody)).unwrap();
        let reply = a.receive(WAIT).unwrap().unwrap();
        assert_eq!(reply.payload, vec![0xff]);
    }

    #[test]
    fn test_relay_rewrites_sender() {
        let relay = MemoryRelay::new();
        let mut a = relay.register("alice", alice().public_key().clone());
        let mut b = relay.register("bob", bob().public_key().clone());

        a.send(&frame::encode_routed(&b.uid(), b"\x00hi")).unwrap();
        let received = b.receive(WAIT).unwrap().unwrap();
        let (sender, body) = frame::decode_routed(&received.payload).unwrap();
        assert_eq!(sender, a.uid());
        assert_eq!(body, b"\x00hi");
    }

    #[test]
    fn test_relay_disconnect() {
        let relay = MemoryRelay::new();
        let mut a = relay.register("alice", alice().public_key().clone());

        relay.disconnect("alice");
        assert_eq!(a.receive(WAIT), Err(ChannelError::Disconnected));
        assert!(a.is_broken());
    }
}
