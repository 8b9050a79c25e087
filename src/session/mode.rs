//! Session mode register and reply mailbox
//!
//! The mode is both the UI state and the gate that decides whether a
//! lookup reply from the relay is expected. Readers share an `RwLock`; the
//! single-slot mailbox has its own mutex and condition variable.
//!
//! Lock order is mailbox, then mode. Nothing takes the mailbox while
//! holding the mode lock.
//!
//! The relay answers lookups in order, so when a caller gives up on a
//! lookup the next reply to arrive is the answer it abandoned. That reply
//! is discarded rather than treated as unsolicited.

use std::sync::{
    Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Shared session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Main menu, nothing in progress
    Idle,
    /// Talking to a friend
    InConversation,
    /// A public-key lookup is outstanding
    AwaitingPkeyResponse,
    /// A notification arrived while idle
    NotifPending,
    /// The session is over; terminal
    Stopped,
}

impl Mode {
    /// Numeric code of the mode
    pub fn code(self) -> i32 {
        match self {
            Mode::Idle => 0,
            Mode::InConversation => 1,
            Mode::AwaitingPkeyResponse => 2,
            Mode::NotifPending => 0xff,
            Mode::Stopped => -1,
        }
    }
}

/// Mode register errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeError {
    /// The session has stopped
    #[error("Session stopped")]
    Stopped,

    /// Another lookup is already outstanding
    #[error("A public-key lookup is already in flight")]
    LookupInFlight,

    /// A reply arrived while no lookup was outstanding
    #[error("Unsolicited lookup reply")]
    Unsolicited,

    /// A reply arrived while an earlier one was still unread
    #[error("Lookup reply mailbox already full")]
    MailboxFull,

    /// No reply arrived in time
    #[error("Timed out waiting for lookup reply")]
    TimedOut,
}

#[derive(Debug)]
struct Mailbox {
    reply: Option<Vec<u8>>,
    // Mode to restore once the outstanding lookup ends
    resume: Mode,
    // Lookups whose caller timed out before the reply arrived
    abandoned: usize,
}

/// The session mode plus the lookup reply mailbox
#[derive(Debug)]
pub struct ModeRegister {
    mode: RwLock<Mode>,
    mailbox: Mutex<Mailbox>,
    delivered: Condvar,
}

impl Default for ModeRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeRegister {
    /// Start in [`Mode::Idle`]
    pub fn new() -> Self {
        ModeRegister {
            mode: RwLock::new(Mode::Idle),
            mailbox: Mutex::new(Mailbox {
                reply: None,
                resume: Mode::Idle,
                abandoned: 0,
            }),
            delivered: Condvar::new(),
        }
    }

    /// Current mode
    pub fn get(&self) -> Mode {
        *self.read()
    }

    /// Whether the session has stopped
    pub fn is_stopped(&self) -> bool {
        self.get() == Mode::Stopped
    }

    /// Change mode and wake every mailbox waiter
    ///
    /// Setting [`Mode::AwaitingPkeyResponse`] is the same as
    /// [`begin_lookup`](Self::begin_lookup). Other modes cannot replace an
    /// outstanding lookup, and nothing replaces [`Mode::Stopped`].
    pub fn set(&self, mode: Mode) -> Result<(), ModeError> {
        match mode {
            Mode::Stopped => {
                self.stop();
                Ok(())
            }
            Mode::AwaitingPkeyResponse => self.begin_lookup(),
            other => {
                {
                    let mut current = self.write();
                    match *current {
                        Mode::Stopped => return Err(ModeError::Stopped),
                        Mode::AwaitingPkeyResponse => return Err(ModeError::LookupInFlight),
                        _ => *current = other,
                    }
                }
                self.broadcast();
                Ok(())
            }
        }
    }

    /// Latch [`Mode::Stopped`] and wake every waiter
    pub fn stop(&self) {
        *self.write() = Mode::Stopped;
        self.broadcast();
    }

    /// Claim the single lookup slot
    ///
    /// Clears any stale reply and remembers the current mode so
    /// [`end_lookup`](Self::end_lookup) can restore it.
    pub fn begin_lookup(&self) -> Result<(), ModeError> {
        let mut mailbox = self.lock_mailbox();
        let mut current = self.write();
        match *current {
            Mode::Stopped => Err(ModeError::Stopped),
            Mode::AwaitingPkeyResponse => Err(ModeError::LookupInFlight),
            previous => {
                mailbox.reply = None;
                mailbox.resume = previous;
                *current = Mode::AwaitingPkeyResponse;
                Ok(())
            }
        }
    }

    /// Release the lookup slot and restore the mode it replaced
    ///
    /// A reply that arrives after this is unsolicited.
    pub fn end_lookup(&self) {
        let mut mailbox = self.lock_mailbox();
        mailbox.reply = None;
        let mut current = self.write();
        if *current == Mode::AwaitingPkeyResponse {
            *current = mailbox.resume;
        }
    }

    /// Hand a lookup reply to the waiting caller
    ///
    /// The first reply after a timed-out lookup answers that lookup and is
    /// dropped.
    pub fn deliver(&self, reply: Vec<u8>) -> Result<(), ModeError> {
        let mut mailbox = self.lock_mailbox();
        let mode = self.get();
        if mode == Mode::Stopped {
            return Err(ModeError::Stopped);
        }
        if mailbox.abandoned > 0 {
            mailbox.abandoned -= 1;
            debug!(len = reply.len(), "discarding reply to abandoned lookup");
            return Ok(());
        }
        if mode != Mode::AwaitingPkeyResponse {
            return Err(ModeError::Unsolicited);
        }
        if mailbox.reply.is_some() {
            return Err(ModeError::MailboxFull);
        }
        mailbox.reply = Some(reply);
        self.delivered.notify_all();
        Ok(())
    }

    /// Block until a reply is delivered, the session stops, or `timeout`
    ///
    /// On timeout the lookup counts as abandoned and its late reply will be
    /// discarded.
    pub fn wait_reply(&self, timeout: Duration) -> Result<Vec<u8>, ModeError> {
        let deadline = Instant::now() + timeout;
        let mut mailbox = self.lock_mailbox();
        loop {
            if let Some(reply) = mailbox.reply.take() {
                return Ok(reply);
            }
            if self.is_stopped() {
                return Err(ModeError::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                mailbox.abandoned += 1;
                return Err(ModeError::TimedOut);
            }
            mailbox = self
                .delivered
                .wait_timeout(mailbox, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Flag a new notification
    ///
    /// Only an idle session switches to [`Mode::NotifPending`]. During a
    /// lookup the flag is carried over to the mode restored afterwards.
    pub fn raise_notification(&self) {
        let mut mailbox = self.lock_mailbox();
        let mut current = self.write();
        match *current {
            Mode::Idle => *current = Mode::NotifPending,
            Mode::AwaitingPkeyResponse if mailbox.resume == Mode::Idle => {
                mailbox.resume = Mode::NotifPending;
            }
            _ => {}
        }
    }

    /// Clear the notification flag
    pub fn acknowledge_notification(&self) {
        let mut mailbox = self.lock_mailbox();
        let mut current = self.write();
        match *current {
            Mode::NotifPending => *current = Mode::Idle,
            Mode::AwaitingPkeyResponse if mailbox.resume == Mode::NotifPending => {
                mailbox.resume = Mode::Idle;
            }
            _ => {}
        }
    }

    fn broadcast(&self) {
        // Taking the mailbox lock orders the wake-up after any waiter's check
        let _mailbox = self.lock_mailbox();
        self.delivered.notify_all();
    }

    fn read(&self) -> RwLockReadGuard<'_, Mode> {
        self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Mode> {
        self.mode.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_mailbox(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mode_codes() {
        assert_eq!(Mode::Idle.code(), 0);
        assert_eq!(Mode::InConversation.code(), 1);
        assert_eq!(Mode::AwaitingPkeyResponse.code(), 2);
        assert_eq!(Mode::NotifPending.code(), 0xff);
        assert_eq!(Mode::Stopped.code(), -1);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let reg = ModeRegister::new();
        reg.set(Mode::InConversation).unwrap();
        reg.stop();

        assert_eq!(reg.set(Mode::Idle), Err(ModeError::Stopped));
        assert_eq!(reg.begin_lookup(), Err(ModeError::Stopped));
        reg.raise_notification();
        reg.end_lookup();
        assert_eq!(reg.get(), Mode::Stopped);
    }

    #[test]
    fn test_single_outstanding_lookup() {
        let reg = ModeRegister::new();
        reg.begin_lookup().unwrap();

        assert_eq!(reg.begin_lookup(), Err(ModeError::LookupInFlight));
        assert_eq!(reg.set(Mode::AwaitingPkeyResponse), Err(ModeError::LookupInFlight));
        assert_eq!(reg.set(Mode::Idle), Err(ModeError::LookupInFlight));

        reg.end_lookup();
        assert_eq!(reg.get(), Mode::Idle);
        reg.begin_lookup().unwrap();
    }

    #[test]
    fn test_end_lookup_restores_previous_mode() {
        let reg = ModeRegister::new();
        reg.set(Mode::InConversation).unwrap();
        reg.begin_lookup().unwrap();
        reg.end_lookup();
        assert_eq!(reg.get(), Mode::InConversation);
    }

    #[test]
    fn test_delivery_is_gated_on_mode() {
        let reg = ModeRegister::new();
        assert_eq!(reg.deliver(vec![0xff]), Err(ModeError::Unsolicited));

        reg.begin_lookup().unwrap();
        reg.deliver(vec![0xff]).unwrap();
        assert_eq!(reg.wait_reply(Duration::from_millis(10)).unwrap(), vec![0xff]);

        reg.end_lookup();
        assert_eq!(reg.deliver(vec![0xff]), Err(ModeError::Unsolicited));
    }

    #[test]
    fn test_second_delivery_is_rejected() {
        let reg = ModeRegister::new();
        reg.begin_lookup().unwrap();
        reg.deliver(vec![1, 2]).unwrap();
        assert_eq!(reg.deliver(vec![3, 4]), Err(ModeError::MailboxFull));
        assert_eq!(reg.wait_reply(Duration::from_millis(10)).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_wait_times_out() {
        let reg = ModeRegister::new();
        reg.begin_lookup().unwrap();
        assert_eq!(
            reg.wait_reply(Duration::from_millis(20)),
            Err(ModeError::TimedOut)
        );
    }

    #[test]
    fn test_late_reply_after_timeout_is_discarded() {
        let reg = ModeRegister::new();
        reg.begin_lookup().unwrap();
        assert_eq!(
            reg.wait_reply(Duration::from_millis(10)),
            Err(ModeError::TimedOut)
        );
        reg.end_lookup();

        reg.deliver(vec![0xff]).unwrap();
        assert_eq!(reg.get(), Mode::Idle);
        assert_eq!(reg.deliver(vec![0xff]), Err(ModeError::Unsolicited));
    }

    #[test]
    fn test_late_reply_does_not_answer_next_lookup() {
        let reg = ModeRegister::new();
        reg.begin_lookup().unwrap();
        assert!(reg.wait_reply(Duration::from_millis(10)).is_err());
        reg.end_lookup();

        reg.begin_lookup().unwrap();
        reg.deliver(vec![0xff]).unwrap();
        reg.deliver(vec![1, 2, 3]).unwrap();
        assert_eq!(reg.wait_reply(Duration::from_secs(1)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_reply_wakes_waiter() {
        let reg = Arc::new(ModeRegister::new());
        reg.begin_lookup().unwrap();

        let waiter = {
            let reg = Arc::clone(&reg);
            thread::spawn(move || reg.wait_reply(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        reg.deliver(vec![9]).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(vec![9]));
    }

    #[test]
    fn test_stop_wakes_waiter_promptly() {
        let reg = Arc::new(ModeRegister::new());
        reg.begin_lookup().unwrap();

        let waiter = {
            let reg = Arc::clone(&reg);
            thread::spawn(move || {
                let started = Instant::now();
                (reg.wait_reply(Duration::from_secs(30)), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        reg.stop();

        let (result, elapsed) = waiter.join().unwrap();
        assert_eq!(result, Err(ModeError::Stopped));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_notification_flag() {
        let reg = ModeRegister::new();
        reg.raise_notification();
        assert_eq!(reg.get(), Mode::NotifPending);
        reg.acknowledge_notification();
        assert_eq!(reg.get(), Mode::Idle);

        reg.set(Mode::InConversation).unwrap();
        reg.raise_notification();
        assert_eq!(reg.get(), Mode::InConversation);
    }

    #[test]
    fn test_notification_during_lookup_survives() {
        let reg = ModeRegister::new();
        reg.begin_lookup().unwrap();
        reg.raise_notification();
        assert_eq!(reg.get(), Mode::AwaitingPkeyResponse);

        reg.end_lookup();
        assert_eq!(reg.get(), Mode::NotifPending);
    }
}
