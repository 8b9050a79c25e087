//! Notifications for the user interface

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{Friend, PendingFriendRequest};
use crate::crypto::Uid;

/// Something the user should be told about
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    /// An authenticated friend request awaiting a decision
    FriendRequest(PendingFriendRequest),
    /// A handshake completed and the friend was stored
    FriendAdded(Friend),
    /// A conversation message from a friend, still encrypted
    Message {
        /// The friend who sent it
        from: Uid,
        /// Conversation body as received
        body: Vec<u8>,
    },
}

/// Consumer of notifications
pub trait NotificationSink: Send + Sync {
    /// Queue an event for the user
    fn enqueue(&self, event: NotificationEvent);
}

/// FIFO notification queue that callers can block on
#[derive(Default)]
pub struct NotificationQueue {
    events: Mutex<VecDeque<NotificationEvent>>,
    arrived: Condvar,
}

impl NotificationQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest event, if any
    pub fn pop(&self) -> Option<NotificationEvent> {
        self.lock().pop_front()
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<NotificationEvent> {
        self.lock().drain(..).collect()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait up to `timeout` for the oldest event
    pub fn wait_pop(&self, timeout: Duration) -> Option<NotificationEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            events = self
                .arrived
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<NotificationEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NotificationSink for NotificationQueue {
    fn enqueue(&self, event: NotificationEvent) {
        self.lock().push_back(event);
        self.arrived.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn message(n: u8) -> NotificationEvent {
        NotificationEvent::Message {
            from: Uid::from_username("bob"),
            body: vec![0, n],
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let queue = NotificationQueue::new();
        queue.enqueue(message(1));
        queue.enqueue(message(2));
        assert_eq!(queue.len(), 2);

        match queue.pop() {
            Some(NotificationEvent::Message { body, .. }) => assert_eq!(body, vec![0, 1]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_pop() {
        let queue = Arc::new(NotificationQueue::new());
        assert!(queue.wait_pop(Duration::from_millis(10)).is_none());

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.enqueue(message(3));
            })
        };
        assert!(queue.wait_pop(Duration::from_secs(5)).is_some());
        producer.join().unwrap();
    }
}
