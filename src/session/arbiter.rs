//! Connection arbiter and background receiver
//!
//! The relay channel is shared between the receiver thread and any caller
//! that needs to send. Whoever holds the [`ChannelGuard`] has it to
//! themselves; send and receive never overlap.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::mode::{ModeError, ModeRegister};
use crate::crypto::Uid;
use crate::error::{SessionError, SessionResult};
use crate::protocol::frame::{decode_inbound, Inbound};
use crate::protocol::WireError;
use crate::transport::{Channel, ChannelError, Frame};

/// Receiver of routed user payloads
///
/// Called on the receiver thread while the channel is held, so an
/// implementation must not send through the same arbiter.
pub trait InboundHandler: Send + Sync {
    /// Handle a body the relay says came from `sender`
    ///
    /// A fatal error ends the session; any other error is logged and the
    /// receiver carries on.
    fn handle_routed(&self, sender: Uid, body: &[u8]) -> SessionResult<()>;
}

/// Exclusive access to the channel, released on drop
pub struct ChannelGuard<'a> {
    channel: MutexGuard<'a, Box<dyn Channel>>,
}

impl Deref for ChannelGuard<'_> {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        &**self.channel
    }
}

impl DerefMut for ChannelGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.channel
    }
}

/// Owner of the single relay channel
pub struct ConnectionArbiter {
    channel: Mutex<Box<dyn Channel>>,
    mode: Arc<ModeRegister>,
    // Callers waiting in acquire_exclusive; the receiver yields to them
    contenders: AtomicUsize,
}

impl ConnectionArbiter {
    /// Take ownership of `channel`
    pub fn new(channel: Box<dyn Channel>, mode: Arc<ModeRegister>) -> Self {
        ConnectionArbiter {
            channel: Mutex::new(channel),
            mode,
            contenders: AtomicUsize::new(0),
        }
    }

    /// The mode register this arbiter reports to
    pub fn mode(&self) -> &Arc<ModeRegister> {
        &self.mode
    }

    /// Wait for exclusive use of the channel
    ///
    /// Fails at once if the session has stopped, and again if it stopped
    /// while waiting.
    pub fn acquire_exclusive(&self) -> Result<ChannelGuard<'_>, ModeError> {
        if self.mode.is_stopped() {
            return Err(ModeError::Stopped);
        }
        self.contenders.fetch_add(1, Ordering::AcqRel);
        let channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        self.contenders.fetch_sub(1, Ordering::AcqRel);
        if self.mode.is_stopped() {
            return Err(ModeError::Stopped);
        }
        Ok(ChannelGuard { channel })
    }

    // The receiver relocks right after every timeout, so it steps aside
    // while a caller is queued instead of racing it for the mutex. The
    // sleep only yields; callers hold the channel for one send, so the
    // queue drains within a few iterations.
    fn acquire_for_receive(&self) -> Result<ChannelGuard<'_>, ModeError> {
        while self.contenders.load(Ordering::Acquire) > 0 {
            if self.mode.is_stopped() {
                return Err(ModeError::Stopped);
            }
            thread::sleep(Duration::from_millis(1));
        }
        let channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        if self.mode.is_stopped() {
            return Err(ModeError::Stopped);
        }
        Ok(ChannelGuard { channel })
    }

    /// Send one frame under exclusive access
    pub fn send(&self, data: &[u8]) -> SessionResult<()> {
        let mut channel = self.acquire_exclusive()?;
        channel.send(data)?;
        Ok(())
    }

    /// Start the background receiver
    pub fn spawn_receiver(
        self: &Arc<Self>,
        handler: Arc<dyn InboundHandler>,
        timeout: Duration,
    ) -> SessionResult<JoinHandle<()>> {
        let arbiter = Arc::clone(self);
        thread::Builder::new()
            .name("relaychat-receiver".to_string())
            .spawn(move || arbiter.receive_loop(handler.as_ref(), timeout))
            .map_err(SessionError::Spawn)
    }

    fn receive_loop(&self, handler: &dyn InboundHandler, timeout: Duration) {
        info!("receiver started");

        let reason = loop {
            let mut channel = match self.acquire_for_receive() {
                Ok(channel) => channel,
                Err(_) => break None,
            };

            match channel.receive(timeout) {
                Ok(None) => {}
                Ok(Some(frame)) => {
                    if let Err(err) = self.dispatch(&frame, handler) {
                        if err.is_fatal() {
                            break Some(err);
                        }
                        warn!(error = %err, "inbound frame handling failed");
                    }
                }
                Err(err) => break Some(SessionError::Channel(err)),
            }
            if channel.is_broken() {
                break Some(SessionError::Channel(ChannelError::Disconnected));
            }
        };

        self.mode.stop();
        match reason {
            Some(err) => error!(error = %err, "session disconnected"),
            None => info!("receiver stopped"),
        }
    }

    /// Route one received frame by its outer type
    pub(crate) fn dispatch(
        &self,
        frame: &Frame,
        handler: &dyn InboundHandler,
    ) -> SessionResult<()> {
        if !frame.is_consistent() {
            return Err(SessionError::RelayViolation(format!(
                "frame declared {} bytes but carried {}",
                frame.declared_len,
                frame.payload.len()
            )));
        }

        match decode_inbound(&frame.payload) {
            Ok(Inbound::Routed { sender, body }) => {
                debug!(sender = %sender, len = body.len(), "routed frame");
                handler.handle_routed(sender, body)
            }
            Ok(Inbound::LookupReply(_)) | Ok(Inbound::NotFound) => {
                self.mode.deliver(frame.payload.clone())?;
                Ok(())
            }
            Err(WireError::UnknownType(ty)) => {
                warn!(frame_type = ty, "ignoring frame of unknown type");
                Ok(())
            }
            Err(err) => Err(SessionError::RelayViolation(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{encode_not_found, encode_routed};
    use crate::session::Mode;
    use crate::transport::{create_pair, ChannelResult, MemoryChannel};
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Uid, Vec<u8>)>>,
    }

    impl InboundHandler for Recorder {
        fn handle_routed(&self, sender: Uid, body: &[u8]) -> SessionResult<()> {
            self.seen.lock().unwrap().push((sender, body.to_vec()));
            Ok(())
        }
    }

    fn start() -> (Arc<ConnectionArbiter>, Arc<Recorder>, MemoryChannel, JoinHandle<()>) {
        let (client, relay) = create_pair();
        let mode = Arc::new(ModeRegister::new());
        let arbiter = Arc::new(ConnectionArbiter::new(Box::new(client), mode));
        let recorder = Arc::new(Recorder::default());
        let handle = arbiter.spawn_receiver(recorder.clone(), TICK).unwrap();
        (arbiter, recorder, relay, handle)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_routed_frames_reach_handler() {
        let (arbiter, recorder, mut relay, handle) = start();
        let bob = Uid::from_username("bob");

        relay.send(&encode_routed(&bob, b"\x00hello")).unwrap();
        wait_until(|| !recorder.seen.lock().unwrap().is_empty());
        assert_eq!(recorder.seen.lock().unwrap()[0], (bob, b"\x00hello".to_vec()));

        arbiter.mode().stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_send_goes_out() {
        let (arbiter, _recorder, mut relay, handle) = start();
        arbiter.send(b"ping").unwrap();
        assert_eq!(relay.receive(WAIT).unwrap().unwrap().payload, b"ping");

        arbiter.mode().stop();
        handle.join().unwrap();
        assert!(matches!(arbiter.send(b"late"), Err(SessionError::Stopped)));
    }

    #[test]
    fn test_lookup_reply_delivered_when_awaiting() {
        let (arbiter, _recorder, mut relay, handle) = start();
        arbiter.mode().begin_lookup().unwrap();

        relay.send(&encode_not_found()).unwrap();
        let reply = arbiter.mode().wait_reply(WAIT).unwrap();
        assert_eq!(reply, vec![0xff]);

        arbiter.mode().end_lookup();
        arbiter.mode().stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_unsolicited_reply_is_fatal() {
        let (arbiter, _recorder, mut relay, handle) = start();

        relay.send(&encode_not_found()).unwrap();
        handle.join().unwrap();
        assert_eq!(arbiter.mode().get(), Mode::Stopped);
    }

    #[test]
    fn test_length_lie_is_fatal() {
        let (arbiter, recorder, mut relay, handle) = start();

        relay
            .send_frame(Frame {
                declared_len: 100,
                payload: encode_routed(&Uid::from_username("bob"), b"\x00hi"),
            })
            .unwrap();
        handle.join().unwrap();

        assert_eq!(arbiter.mode().get(), Mode::Stopped);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_inner_length_lie_is_fatal() {
        let (arbiter, _recorder, mut relay, handle) = start();

        let mut frame = encode_routed(&Uid::from_username("bob"), b"\x00hi");
        frame[0x28] += 1;
        relay.send(&frame).unwrap();
        handle.join().unwrap();

        assert_eq!(arbiter.mode().get(), Mode::Stopped);
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let (arbiter, recorder, mut relay, handle) = start();

        relay.send(&[0x42, 1, 2, 3]).unwrap();
        relay.send(&encode_routed(&Uid::from_username("bob"), b"\x00ok")).unwrap();
        wait_until(|| !recorder.seen.lock().unwrap().is_empty());
        assert_ne!(arbiter.mode().get(), Mode::Stopped);

        arbiter.mode().stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_channel_error_stops_session() {
        let (arbiter, _recorder, relay, handle) = start();
        drop(relay);

        handle.join().unwrap();
        assert_eq!(arbiter.mode().get(), Mode::Stopped);
        assert!(matches!(
            arbiter.acquire_exclusive().err(),
            Some(ModeError::Stopped)
        ));
    }

    #[test]
    fn test_stop_observed_within_receive_timeout() {
        let (arbiter, _recorder, _relay, handle) = start();
        thread::sleep(TICK);

        let started = Instant::now();
        arbiter.mode().stop();
        handle.join().unwrap();
        assert!(started.elapsed() < TICK * 10);
    }

    #[test]
    fn test_guard_is_exclusive() {
        let (client, _relay) = create_pair();
        let arbiter = Arc::new(ConnectionArbiter::new(
            Box::new(client),
            Arc::new(ModeRegister::new()),
        ));

        let guard = arbiter.acquire_exclusive().unwrap();
        let contender = {
            let arbiter = Arc::clone(&arbiter);
            thread::spawn(move || {
                let started = Instant::now();
                let _guard = arbiter.acquire_exclusive().unwrap();
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(guard);

        assert!(contender.join().unwrap() >= Duration::from_millis(40));
    }

    #[test]
    fn test_broken_channel_send_error() {
        let (client, relay) = create_pair();
        drop(relay);
        let arbiter = ConnectionArbiter::new(Box::new(client), Arc::new(ModeRegister::new()));

        let err = arbiter.send(b"x").unwrap_err();
        assert!(matches!(err, SessionError::Channel(ChannelError::Disconnected)));
        assert!(err.is_fatal());
    }

    // Reports itself broken but never returns an error from receive
    struct SilentlyBroken;

    impl Channel for SilentlyBroken {
        fn send(&mut self, _data: &[u8]) -> ChannelResult<()> {
            Ok(())
        }

        fn receive(&mut self, timeout: Duration) -> ChannelResult<Option<Frame>> {
            thread::sleep(timeout);
            Ok(None)
        }

        fn is_broken(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_broken_channel_stops_receiver() {
        let mode = Arc::new(ModeRegister::new());
        let arbiter = Arc::new(ConnectionArbiter::new(Box::new(SilentlyBroken), mode));
        let handle = arbiter
            .spawn_receiver(Arc::new(Recorder::default()), TICK)
            .unwrap();

        handle.join().unwrap();
        assert_eq!(arbiter.mode().get(), Mode::Stopped);
    }
}
