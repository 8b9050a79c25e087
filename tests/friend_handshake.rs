//! End-to-end friend handshakes through the in-memory relay

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use relaychat::crypto::identity::MIN_KEY_BITS;
use relaychat::protocol::frame::encode_routed;
use relaychat::transport::create_pair;
use relaychat::{
    Channel, Fingerprint, Frame, FriendRequestEngine, FriendStore, Identity, MemoryFriendStore,
    MemoryRelay, Mode, NotificationEvent, NotificationQueue, RequestOutcome, Session,
    SessionConfig, SessionError,
};

const WAIT: Duration = Duration::from_secs(10);

fn identity(cell: &'static OnceLock<Identity>, username: &str) -> Identity {
    cell.get_or_init(|| Identity::generate(username, MIN_KEY_BITS as usize).unwrap())
        .clone()
}

fn alice() -> Identity {
    static CELL: OnceLock<Identity> = OnceLock::new();
    identity(&CELL, "alice")
}

fn bob() -> Identity {
    static CELL: OnceLock<Identity> = OnceLock::new();
    identity(&CELL, "bob")
}

fn config() -> SessionConfig {
    SessionConfig {
        receive_timeout_ms: 20,
        lookup_timeout_ms: 5000,
        rsa_bits: MIN_KEY_BITS as usize,
    }
}

struct Client {
    engine: Arc<FriendRequestEngine>,
    queue: Arc<NotificationQueue>,
    store: Arc<MemoryFriendStore>,
}

impl Client {
    fn session(&self) -> &Arc<Session> {
        self.engine.session()
    }
}

fn start(identity: Identity, channel: Box<dyn Channel>) -> Client {
    let queue = Arc::new(NotificationQueue::new());
    let store = Arc::new(MemoryFriendStore::new());
    let session = Arc::new(Session::new(
        identity,
        config(),
        channel,
        store.clone(),
        queue.clone(),
    ));
    let engine = FriendRequestEngine::start(session).unwrap();
    Client {
        engine,
        queue,
        store,
    }
}

fn connect(relay: &MemoryRelay, identity: Identity) -> Client {
    let channel = relay.register(identity.username(), identity.public_key().clone());
    start(identity, Box::new(channel))
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_full_handshake() {
    let relay = MemoryRelay::new();
    let alice = connect(&relay, alice());
    let bob = connect(&relay, bob());
    let bob_fingerprint = bob.session().identity().fingerprint();

    let confirm =
        move |username: &str, fp: &Fingerprint| username == "bob" && *fp == bob_fingerprint;
    let outcome = alice.engine.send_friend_request("bob", &confirm).unwrap();
    assert_eq!(outcome, RequestOutcome::Sent);

    let pending = match bob.queue.wait_pop(WAIT) {
        Some(NotificationEvent::FriendRequest(pending)) => pending,
        other => panic!("bob expected a friend request, got {:?}", other),
    };
    assert_eq!(pending.username, "alice");
    assert_eq!(pending.fingerprint(), alice.session().identity().fingerprint());
    assert_eq!(bob.session().mode().get(), Mode::NotifPending);
    bob.session().acknowledge_notifications();

    let bob_side = bob.engine.accept(&pending).unwrap();

    let alice_side = match alice.queue.wait_pop(WAIT) {
        Some(NotificationEvent::FriendAdded(friend)) => friend,
        other => panic!("alice expected a new friend, got {:?}", other),
    };
    assert_eq!(alice_side.username, "bob");
    assert_eq!(&alice_side.public_key, bob.session().identity().public_key());
    assert_eq!(&bob_side.public_key, alice.session().identity().public_key());

    // Each side's send keys are the other's receive keys
    assert_eq!(alice_side.keys.send_symm, bob_side.keys.recv_symm);
    assert_eq!(alice_side.keys.recv_symm, bob_side.keys.send_symm);
    assert_eq!(alice_side.keys.send_hmac, bob_side.keys.recv_hmac);
    assert_eq!(alice_side.keys.recv_hmac, bob_side.keys.send_hmac);
    assert_ne!(alice_side.keys.send_symm, alice_side.keys.recv_symm);

    assert!(alice.store.contains(&bob.session().identity().uid()));
    assert!(bob.store.contains(&alice.session().identity().uid()));

    // A second request to an existing friend never reaches the relay
    let again = alice.engine.send_friend_request("bob", &confirm).unwrap_err();
    assert!(matches!(again, SessionError::AlreadyFriends(_)));

    alice.session().shutdown();
    bob.session().shutdown();
}

#[test]
fn test_request_to_unknown_user() {
    let relay = MemoryRelay::new();
    let alice = connect(&relay, alice());

    let never = |_: &str, _: &Fingerprint| -> bool { panic!("no key to confirm") };
    let outcome = alice.engine.send_friend_request("mallory", &never).unwrap();
    assert_eq!(outcome, RequestOutcome::NotFound);
    assert_eq!(alice.session().mode().get(), Mode::Idle);
    assert!(alice.session().is_running());

    alice.session().shutdown();
}

#[test]
fn test_declined_fingerprint_sends_nothing() {
    let relay = MemoryRelay::new();
    let alice = connect(&relay, alice());
    let bob = connect(&relay, bob());

    let decline = |_: &str, _: &Fingerprint| false;
    let outcome = alice.engine.send_friend_request("bob", &decline).unwrap();
    assert_eq!(outcome, RequestOutcome::Canceled);

    assert!(bob.queue.wait_pop(Duration::from_millis(200)).is_none());
    assert!(alice.store.list().is_empty());

    alice.session().shutdown();
    bob.session().shutdown();
}

#[test]
fn test_length_lie_stops_session() {
    let (channel, mut relay) = create_pair();
    let alice = start(alice(), Box::new(channel));

    let mut payload = encode_routed(&bob().uid(), b"\x00hello");
    payload.truncate(payload.len() - 2);
    relay
        .send_frame(Frame {
            declared_len: payload.len() as u64 + 2,
            payload,
        })
        .unwrap();

    wait_until("session to stop", || !alice.session().is_running());
    assert_eq!(alice.session().mode().get(), Mode::Stopped);
    assert!(alice.queue.is_empty());

    let err = alice.session().send(b"\x01").unwrap_err();
    assert!(matches!(err, SessionError::Stopped));
    alice.session().shutdown();
}

#[test]
fn test_relay_disconnect_stops_session() {
    let relay = MemoryRelay::new();
    let alice = connect(&relay, alice());

    relay.disconnect("alice");
    wait_until("session to stop", || !alice.session().is_running());

    let never = |_: &str, _: &Fingerprint| true;
    let err = alice.engine.send_friend_request("bob", &never).unwrap_err();
    assert!(matches!(err, SessionError::Stopped));
    alice.session().shutdown();
}
