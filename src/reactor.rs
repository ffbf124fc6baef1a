//! The single-threaded core: one readiness loop owning every socket.
//!
//! All connection state mutates here and nowhere else; this is the
//! synchronization principle of the whole crate. The façade talks to the
//! loop through a command channel plus a waker; readiness events carry a
//! token that maps back to either the listener, the waker, an in-flight
//! handshake, or an established connection, and every dispatch re-checks
//! that the target still exists before touching it.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::connection::{id_for, Connection, ConnectionTable};
use crate::event::{ConnectionId, Event, EventQueue};
use crate::frame::{self, Opcode};
use crate::handshake;
use crate::http::Status;

/// Token of the listening socket.
const LISTENER: Token = Token(0);
/// Token of the cross-thread waker.
const WAKER: Token = Token(1);
/// First token handed to an in-flight handshake. Handshake tokens are
/// even; connection tokens are odd.
const FIRST_HANDSHAKE_TOKEN: usize = 2;

/// Tasks posted by the façade onto the reactor thread.
pub(crate) enum Command {
    /// Serialize and queue a frame on a connection, if it still exists.
    Send {
        /// Target connection.
        id: ConnectionId,
        /// Text or Binary.
        opcode: Opcode,
        /// Raw message bytes.
        payload: Vec<u8>,
    },
    /// Drop a connection, if it still exists.
    Drop(ConnectionId),
    /// Shut the whole loop down.
    Stop,
}

/// What a per-connection readiness handler decided.
enum IoOutcome {
    /// Keep the connection.
    Continue,
    /// Fall through to `drop_impl`.
    Drop,
}

/// What a handshake readiness step decided.
enum HandshakeStep {
    /// Still reading or writing.
    Pending,
    /// Reply fully written and the upgrade succeeded.
    Promote,
    /// Failed or rejected; discard the socket.
    Discard,
}

/// An accepted socket that has not finished the upgrade yet.
struct Handshake {
    stream: TcpStream,
    request: Vec<u8>,
    reply: Option<HandshakeReply>,
}

struct HandshakeReply {
    bytes: Vec<u8>,
    written: usize,
    upgraded: bool,
}

impl Handshake {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            request: Vec::new(),
            reply: None,
        }
    }

    /// Advances the handshake as far as readiness allows.
    fn step(
        &mut self,
        registry: &Registry,
        token: Token,
        readable: bool,
        max_request_bytes: usize,
    ) -> HandshakeStep {
        if self.reply.is_none() {
            if !readable {
                return HandshakeStep::Pending;
            }
            match self.read_request(max_request_bytes) {
                Ok(true) => {
                    let (status, bytes) = handshake::respond(&self.request);
                    if status != Status::Ok {
                        warn!(status = status.code(), "handshake rejected");
                    }
                    self.reply = Some(HandshakeReply {
                        bytes,
                        written: 0,
                        upgraded: status == Status::Ok,
                    });
                    if let Err(err) =
                        registry.reregister(&mut self.stream, token, Interest::WRITABLE)
                    {
                        warn!(error = %err, "handshake reregister failed");
                        return HandshakeStep::Discard;
                    }
                    // Fall through and try to write the reply right away.
                }
                Ok(false) => return HandshakeStep::Pending,
                Err(err) => {
                    debug!(error = %err, "handshake read failed");
                    return HandshakeStep::Discard;
                }
            }
        }

        self.write_reply()
    }

    /// Reads request bytes. `Ok(true)` once the header terminator is seen
    /// or the cap is exceeded (validation then produces the 400).
    fn read_request(&mut self, max_request_bytes: usize) -> io::Result<bool> {
        let mut chunk = [0u8; 512];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.request.extend_from_slice(&chunk[..n]);
                    if self.request.windows(4).any(|w| w == b"\r\n\r\n") {
                        return Ok(true);
                    }
                    if self.request.len() > max_request_bytes {
                        return Ok(true);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn write_reply(&mut self) -> HandshakeStep {
        let Some(reply) = &mut self.reply else {
            return HandshakeStep::Pending;
        };
        while reply.written < reply.bytes.len() {
            match self.stream.write(&reply.bytes[reply.written..]) {
                Ok(0) => return HandshakeStep::Discard,
                Ok(n) => reply.written += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStep::Pending;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(error = %err, "handshake write failed");
                    return HandshakeStep::Discard;
                }
            }
        }
        if reply.upgraded {
            HandshakeStep::Promote
        } else {
            HandshakeStep::Discard
        }
    }
}

/// The event loop. Constructed on the caller's thread, run on the worker.
pub(crate) struct Reactor {
    poll: Poll,
    listener: TcpListener,
    table: ConnectionTable,
    pending: HashMap<Token, Handshake>,
    next_handshake_token: usize,
    events_out: Arc<EventQueue>,
    commands: Receiver<Command>,
    stopped: Arc<AtomicBool>,
    config: ServerConfig,
    running: bool,
}

impl Reactor {
    /// Wires the loop up around an already-bound listener. Returns the
    /// waker the façade uses to make posted commands prompt.
    pub fn new(
        listener: std::net::TcpListener,
        events_out: Arc<EventQueue>,
        commands: Receiver<Command>,
        stopped: Arc<AtomicBool>,
        config: ServerConfig,
    ) -> io::Result<(Self, Waker)> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok((
            Self {
                poll,
                listener,
                table: ConnectionTable::new(),
                pending: HashMap::new(),
                next_handshake_token: FIRST_HANDSHAKE_TOKEN,
                events_out,
                commands,
                stopped,
                config,
                running: true,
            },
            waker,
        ))
    }

    /// Runs until a `Stop` command arrives.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(self.config.events_capacity);

        while self.running {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "poll failed");
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => self.on_accept_ready(),
                    token => {
                        // Hangups and errors surface as reads so the
                        // handler observes the EOF or the error itself.
                        let readable = event.is_readable()
                            || event.is_read_closed()
                            || event.is_error();
                        let writable = event.is_writable() || event.is_write_closed();
                        if let Some(id) = id_for(token) {
                            self.on_connection_ready(id, readable, writable);
                        } else {
                            self.on_handshake_ready(token, readable);
                        }
                    }
                }
            }

            self.drain_commands();
        }

        // Cancellation is synchronous here, so the entries whose erase was
        // deferred by in-flight I/O drain at loop exit.
        self.table.clear();
        debug!("reactor stopped");
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send {
                    id,
                    opcode,
                    payload,
                } => self.handle_send(id, opcode, &payload),
                Command::Drop(id) => self.drop_impl(id),
                Command::Stop => {
                    self.handle_stop();
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Accept & handshake
    // ------------------------------------------------------------------

    fn on_accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted");
                    if self.config.nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    self.begin_handshake(stream);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    error!(error = %err, "accept error");
                    return;
                }
            }
        }
    }

    fn begin_handshake(&mut self, mut stream: TcpStream) {
        let token = Token(self.next_handshake_token);
        self.next_handshake_token += 2;

        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            warn!(error = %err, "failed to register accepted socket");
            return;
        }
        self.pending.insert(token, Handshake::new(stream));
    }

    fn on_handshake_ready(&mut self, token: Token, readable: bool) {
        let step = match self.pending.get_mut(&token) {
            Some(hs) => hs.step(
                self.poll.registry(),
                token,
                readable,
                self.config.max_handshake_bytes,
            ),
            None => return,
        };

        match step {
            HandshakeStep::Pending => {}
            HandshakeStep::Promote => {
                if let Some(hs) = self.pending.remove(&token) {
                    self.promote(hs.stream);
                }
            }
            HandshakeStep::Discard => {
                if let Some(mut hs) = self.pending.remove(&token) {
                    let _ = self.poll.registry().deregister(&mut hs.stream);
                }
            }
        }
    }

    /// Moves an upgraded socket into the table; the id exists from here on.
    fn promote(&mut self, stream: TcpStream) {
        let conn = self.table.add(stream);
        let id = conn.id;
        let token = conn.token();
        conn.is_reading = true;

        if let Err(err) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::READABLE)
        {
            warn!(id, error = %err, "failed to arm new connection");
            conn.close(self.poll.registry());
            self.table.erase(id);
            return;
        }

        debug!(id, "connection established");
        self.events_out.post(Event::NewConnection(id));
    }

    // ------------------------------------------------------------------
    // Established connections
    // ------------------------------------------------------------------

    fn on_connection_ready(&mut self, id: ConnectionId, readable: bool, writable: bool) {
        if writable {
            if let IoOutcome::Drop = self.flush_send_queue(id) {
                self.drop_impl(id);
                return;
            }
        }
        if readable {
            if let IoOutcome::Drop = self.receive_frames(id) {
                self.drop_impl(id);
            }
        }
    }

    /// Reads as much as the socket yields, consuming every complete frame
    /// buffered along the way (frames may arrive pipelined).
    fn receive_frames(&mut self, id: ConnectionId) -> IoOutcome {
        let Some(conn) = self.table.find_mut(id) else {
            return IoOutcome::Continue;
        };
        if conn.is_closed {
            return IoOutcome::Drop;
        }

        loop {
            if !conn.receiver.is_valid_frame() {
                warn!(id, "invalid frame");
                return IoOutcome::Drop;
            }

            while conn.receiver.is_complete() {
                match Opcode::from_u8(conn.receiver.opcode_raw()) {
                    Some(Opcode::Close) => {
                        conn.send_queue.push_back(frame::CLOSE_REPLY.to_vec());
                        flush_best_effort(conn);
                        return IoOutcome::Drop;
                    }
                    Some(Opcode::Text | Opcode::Binary) => {
                        conn.receiver.unmask();
                        let payload = conn.receiver.payload().to_vec();
                        self.events_out.post(Event::Message(id, payload));
                        conn.receiver.shift_buffer();
                        if !conn.receiver.is_valid_frame() {
                            warn!(id, "invalid frame");
                            return IoOutcome::Drop;
                        }
                    }
                    _ => {
                        warn!(id, opcode = conn.receiver.opcode_raw(), "unknown opcode");
                        return IoOutcome::Drop;
                    }
                }
            }

            match conn.stream.read(conn.receiver.tail()) {
                Ok(0) => {
                    debug!(id, "peer closed");
                    return IoOutcome::Drop;
                }
                Ok(n) => conn.receiver.add_bytes(n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return IoOutcome::Continue;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(id, error = %err, "recv error");
                    return IoOutcome::Drop;
                }
            }
        }
    }

    /// Writes queued frames head-first until the socket blocks or the
    /// queue drains, keeping `is_sending` and the interest set in step.
    fn flush_send_queue(&mut self, id: ConnectionId) -> IoOutcome {
        let Some(conn) = self.table.find_mut(id) else {
            return IoOutcome::Continue;
        };
        if conn.is_closed {
            return IoOutcome::Drop;
        }

        while let Some(head) = conn.send_queue.front() {
            match conn.stream.write(&head[conn.send_offset..]) {
                Ok(0) => {
                    warn!(id, "send error: write returned zero");
                    return IoOutcome::Drop;
                }
                Ok(n) => {
                    conn.send_offset += n;
                    if conn.send_offset == head.len() {
                        conn.send_queue.pop_front();
                        conn.send_offset = 0;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !conn.is_sending {
                        conn.is_sending = true;
                        let token = conn.token();
                        let interest = conn.interest();
                        if let Err(err) =
                            self.poll
                                .registry()
                                .reregister(&mut conn.stream, token, interest)
                        {
                            warn!(id, error = %err, "failed to arm write interest");
                            return IoOutcome::Drop;
                        }
                    }
                    return IoOutcome::Continue;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(id, error = %err, "send error");
                    return IoOutcome::Drop;
                }
            }
        }

        if conn.is_sending {
            conn.is_sending = false;
            let token = conn.token();
            let interest = conn.interest();
            if let Err(err) = self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, interest)
            {
                warn!(id, error = %err, "failed to disarm write interest");
                return IoOutcome::Drop;
            }
        }
        IoOutcome::Continue
    }

    // ------------------------------------------------------------------
    // Posted tasks
    // ------------------------------------------------------------------

    fn handle_send(&mut self, id: ConnectionId, opcode: Opcode, payload: &[u8]) {
        let Some(conn) = self.table.find_mut(id) else {
            // The connection went away before the task ran; that is fine.
            return;
        };
        if conn.is_closed {
            return;
        }

        match frame::serialize(opcode, payload) {
            Ok(bytes) => conn.send_queue.push_back(bytes),
            Err(err) => {
                // The façade bounds payload sizes, so this only fires when
                // bypassed; the connection stays open either way.
                error!(id, error = %err, "discarding unsendable message");
                return;
            }
        }

        if let IoOutcome::Drop = self.flush_send_queue(id) {
            self.drop_impl(id);
        }
    }

    /// Closes and eventually erases a connection.
    ///
    /// Two phases: close + `Disconnect` exactly once, then erase as soon
    /// as no I/O is in flight. Closing cancels interest synchronously, so
    /// the erase happens right here; the split guards the invariant that
    /// an entry never disappears while something still references it.
    fn drop_impl(&mut self, id: ConnectionId) {
        let Some(conn) = self.table.find_mut(id) else {
            return;
        };

        let was_closed = conn.is_closed;
        if !was_closed {
            conn.close(self.poll.registry());
        }
        let idle = !conn.is_reading && !conn.is_sending;

        if !was_closed {
            self.events_out.post(Event::Disconnect(id));
        }
        if idle {
            self.table.erase(id);
        }
    }

    fn handle_stop(&mut self) {
        debug!("stopping reactor");
        self.running = false;

        let registry = self.poll.registry();
        let _ = registry.deregister(&mut self.listener);
        for hs in self.pending.values_mut() {
            let _ = registry.deregister(&mut hs.stream);
        }
        self.pending.clear();

        self.table.close_all(registry);
    }
}

/// One best-effort pass over the send queue, used for the close reply;
/// the connection is about to be dropped, so blocking and errors just end
/// the attempt.
fn flush_best_effort(conn: &mut Connection) {
    while let Some(head) = conn.send_queue.front() {
        match conn.stream.write(&head[conn.send_offset..]) {
            Ok(0) => return,
            Ok(n) => {
                conn.send_offset += n;
                if conn.send_offset == head.len() {
                    conn.send_queue.pop_front();
                    conn.send_offset = 0;
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return,
        }
    }
}
