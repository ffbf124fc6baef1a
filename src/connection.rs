//! Per-client connection state and the id-keyed table that owns it.
//!
//! Everything here is touched only from the reactor thread; the table
//! needs no locking. Readiness dispatch looks connections up by id and
//! re-validates existence on every completion, so nothing holds a
//! reference across events.

use std::collections::{HashMap, VecDeque};
use std::net::Shutdown;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::event::ConnectionId;
use crate::frame::FrameReceiver;

/// Poll token for an established connection.
///
/// Connection tokens are odd (`2·id + 1`); even tokens belong to
/// in-flight handshakes. Ids start at 1, so no connection collides with
/// the listener and waker tokens.
pub(crate) fn token_for(id: ConnectionId) -> Token {
    Token(id as usize * 2 + 1)
}

/// Inverse of [`token_for`]; `None` for tokens outside the connection
/// range.
pub(crate) fn id_for(token: Token) -> Option<ConnectionId> {
    if token.0 % 2 == 1 {
        Some(((token.0 - 1) / 2) as ConnectionId)
    } else {
        None
    }
}

/// One accepted, upgraded client.
#[derive(Debug)]
pub(crate) struct Connection {
    /// Immutable id, assigned at handshake completion.
    pub id: ConnectionId,
    /// The socket; exclusively owned.
    pub stream: TcpStream,
    /// Serialized frames awaiting transmission, FIFO. When `is_sending`,
    /// the head is the frame currently on the wire.
    pub send_queue: VecDeque<Vec<u8>>,
    /// Bytes of the queue head already written.
    pub send_offset: usize,
    /// Inbound frame accumulator.
    pub receiver: FrameReceiver,
    /// A write is in flight (write interest registered, queue non-empty).
    pub is_sending: bool,
    /// A read is in flight (read interest registered).
    pub is_reading: bool,
    /// The socket has been shut down.
    pub is_closed: bool,
}

impl Connection {
    fn new(id: ConnectionId, stream: TcpStream) -> Self {
        Self {
            id,
            stream,
            send_queue: VecDeque::new(),
            send_offset: 0,
            receiver: FrameReceiver::new(),
            is_sending: false,
            is_reading: false,
            is_closed: false,
        }
    }

    /// Poll token of this connection.
    pub fn token(&self) -> Token {
        token_for(self.id)
    }

    /// The interest set matching the lifecycle flags.
    pub fn interest(&self) -> Interest {
        if self.is_sending {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    /// Shuts the connection down. Idempotent; every error is swallowed.
    ///
    /// Deregistering cancels all interest, which in a readiness model is
    /// the whole of cancellation; nothing remains in flight afterwards,
    /// so the lifecycle flags clear here and the caller may erase the
    /// entry immediately.
    pub fn close(&mut self, registry: &Registry) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.is_reading = false;
        self.is_sending = false;
    }
}

/// Owner of all established connections, keyed by id.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    last_id: ConnectionId,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly upgraded socket, assigning the next id.
    pub fn add(&mut self, stream: TcpStream) -> &mut Connection {
        self.last_id = self.last_id.wrapping_add(1);
        let id = self.last_id;
        self.connections.entry(id).or_insert(Connection::new(id, stream))
    }

    pub fn find_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn erase(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Closes every connection without erasing; entries disappear as
    /// their in-flight work drains (immediately, in practice; see
    /// [`Connection::close`]).
    pub fn close_all(&mut self, registry: &Registry) {
        for conn in self.connections.values_mut() {
            conn.close(registry);
        }
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn test_stream(listener: &TcpListener) -> TcpStream {
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        TcpStream::from_std(stream)
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnectionTable::new();

        let first = table.add(test_stream(&listener)).id;
        let second = table.add(test_stream(&listener)).id;
        let third = table.add(test_stream(&listener)).id;
        assert_eq!((first, second, third), (1, 2, 3));
    }

    #[test]
    fn erased_ids_are_never_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnectionTable::new();

        let first = table.add(test_stream(&listener)).id;
        table.erase(first);
        let second = table.add(test_stream(&listener)).id;
        assert_eq!(second, first + 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn find_after_erase_returns_none() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnectionTable::new();

        let id = table.add(test_stream(&listener)).id;
        assert!(table.find_mut(id).is_some());
        table.erase(id);
        assert!(table.find_mut(id).is_none());
    }

    #[test]
    fn close_is_idempotent_and_clears_flags() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let poll = mio::Poll::new().unwrap();
        let mut table = ConnectionTable::new();

        let conn = table.add(test_stream(&listener));
        conn.is_reading = true;
        conn.is_sending = true;

        conn.close(poll.registry());
        assert!(conn.is_closed);
        assert!(!conn.is_reading);
        assert!(!conn.is_sending);

        // Second close is a no-op.
        conn.close(poll.registry());
        assert!(conn.is_closed);
    }

    #[test]
    fn close_all_marks_every_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let poll = mio::Poll::new().unwrap();
        let mut table = ConnectionTable::new();

        let a = table.add(test_stream(&listener)).id;
        let b = table.add(test_stream(&listener)).id;
        table.close_all(poll.registry());

        assert!(table.find_mut(a).unwrap().is_closed);
        assert!(table.find_mut(b).unwrap().is_closed);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn token_round_trip() {
        for id in [1, 2, 42, ConnectionId::MAX] {
            assert_eq!(id_for(token_for(id)), Some(id));
        }
        assert_eq!(id_for(Token(0)), None);
        assert_eq!(id_for(Token(4)), None);
    }

    #[test]
    fn interest_follows_sending_flag() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ConnectionTable::new();

        let conn = table.add(test_stream(&listener));
        assert!(!conn.interest().is_writable());
        conn.is_sending = true;
        assert!(conn.interest().is_writable());
        assert!(conn.interest().is_readable());
    }
}
