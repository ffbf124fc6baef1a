//! Events delivered to the embedding application.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Identifier of one accepted connection.
///
/// Assigned by the reactor when a handshake completes, monotonically
/// increasing from 1 and never reused within a server lifetime. At 100
/// new connections per second the counter lasts over a year.
pub type ConnectionId = u32;

/// Something the server wants the application to know.
///
/// For any given id, `NewConnection` strictly precedes every `Message`,
/// and `Disconnect` strictly follows them. Messages are delivered in the
/// order their frames arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A client completed the handshake.
    NewConnection(ConnectionId),
    /// A client sent a text or binary message; the payload is unmasked.
    Message(ConnectionId, Vec<u8>),
    /// A connection went away, whether dropped by the application, closed
    /// by the peer, or lost.
    Disconnect(ConnectionId),
}

impl Event {
    /// The connection this event concerns.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Self::NewConnection(id) | Self::Message(id, _) | Self::Disconnect(id) => *id,
        }
    }
}

/// Unbounded producer→consumer FIFO between the reactor and the
/// application's `poll` calls. The mutex here is the only lock in the
/// crate.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends an event. Called from the reactor thread only.
    pub(crate) fn post(&self, event: Event) {
        self.queue.lock().push_back(event);
    }

    /// Removes and returns the oldest event, never blocking.
    pub(crate) fn poll(&self) -> Option<Event> {
        self.queue.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_on_empty_queue_returns_none() {
        let queue = EventQueue::new();
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn events_come_back_in_fifo_order() {
        let queue = EventQueue::new();
        queue.post(Event::NewConnection(1));
        queue.post(Event::Message(1, b"hi".to_vec()));
        queue.post(Event::Disconnect(1));

        assert_eq!(queue.poll(), Some(Event::NewConnection(1)));
        assert_eq!(queue.poll(), Some(Event::Message(1, b"hi".to_vec())));
        assert_eq!(queue.poll(), Some(Event::Disconnect(1)));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn connection_id_accessor() {
        assert_eq!(Event::NewConnection(3).connection_id(), 3);
        assert_eq!(Event::Message(4, Vec::new()).connection_id(), 4);
        assert_eq!(Event::Disconnect(5).connection_id(), 5);
    }
}
