//! Client session context
//!
//! A [`Session`] bundles everything one logged-in client needs: its
//! identity, the mode register, the arbiter over the relay channel, and the
//! friend and notification collaborators. It is passed explicitly to every
//! component instead of living in globals.

pub mod arbiter;
pub mod mode;

pub use arbiter::{ChannelGuard, ConnectionArbiter, InboundHandler};
pub use mode::{Mode, ModeError, ModeRegister};

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::config::SessionConfig;
use crate::crypto::Identity;
use crate::error::{SessionError, SessionResult};
use crate::friends::{FriendStore, NotificationEvent, NotificationSink};
use crate::transport::Channel;

/// State shared by every part of one client
pub struct Session {
    identity: Identity,
    config: SessionConfig,
    mode: Arc<ModeRegister>,
    arbiter: Arc<ConnectionArbiter>,
    friends: Arc<dyn FriendStore>,
    notifications: Arc<dyn NotificationSink>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a session over an authenticated relay channel
    pub fn new(
        identity: Identity,
        config: SessionConfig,
        channel: Box<dyn Channel>,
        friends: Arc<dyn FriendStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let mode = Arc::new(ModeRegister::new());
        let arbiter = Arc::new(ConnectionArbiter::new(channel, Arc::clone(&mode)));
        Session {
            identity,
            config,
            mode,
            arbiter,
            friends,
            notifications,
            receiver: Mutex::new(None),
        }
    }

    /// Our identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The mode register
    pub fn mode(&self) -> &Arc<ModeRegister> {
        &self.mode
    }

    /// The channel arbiter
    pub fn arbiter(&self) -> &Arc<ConnectionArbiter> {
        &self.arbiter
    }

    /// The friend registry
    pub fn friends(&self) -> &Arc<dyn FriendStore> {
        &self.friends
    }

    /// Whether the session is still usable
    pub fn is_running(&self) -> bool {
        !self.mode.is_stopped()
    }

    /// Start the background receiver, routing user payloads to `handler`
    ///
    /// Starting twice is a no-op.
    pub fn start_receiver(&self, handler: Arc<dyn InboundHandler>) -> SessionResult<()> {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        if receiver.is_some() {
            return Ok(());
        }
        let handle = self
            .arbiter
            .spawn_receiver(handler, self.config.receive_timeout())?;
        *receiver = Some(handle);
        Ok(())
    }

    /// Send one frame to the relay
    pub fn send(&self, data: &[u8]) -> SessionResult<()> {
        self.arbiter.send(data).map_err(|e| self.fail(e))
    }

    /// Latch [`Mode::Stopped`] if `err` is fatal, then hand it back
    pub fn fail(&self, err: SessionError) -> SessionError {
        if err.is_fatal() && !self.mode.is_stopped() {
            error!(error = %err, "session disconnected");
            self.mode.stop();
        }
        err
    }

    /// Queue a notification and flag it in the mode
    pub fn notify(&self, event: NotificationEvent) {
        self.notifications.enqueue(event);
        self.mode.raise_notification();
    }

    /// The user has seen the pending notifications
    pub fn acknowledge_notifications(&self) {
        self.mode.acknowledge_notification();
    }

    /// Stop the session and wait for the receiver to exit
    pub fn shutdown(&self) {
        self.mode.stop();
        let handle = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("receiver thread panicked");
            }
        }
        info!(user = self.identity.username(), "session shut down");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("mode", &self.mode.get())
            .finish_non_exhaustive()
    }
}
