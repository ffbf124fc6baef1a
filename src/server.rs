//! The thread-safe façade the application holds.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::Waker;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{SendError, StartError};
use crate::event::{ConnectionId, Event, EventQueue};
use crate::frame::{Opcode, MAX_MESSAGE_LEN};
use crate::reactor::{Command, Reactor};

/// An embeddable WebSocket server.
///
/// `start` binds the listener and spawns the worker thread that owns all
/// connection state. The mutating calls (`send_text`, `send_binary`,
/// `drop_connection`, `stop`) post commands onto that thread and return
/// immediately; `poll` drains the event queue without blocking.
///
/// Any thread may call the `&self` methods concurrently. Dropping the
/// server stops it.
pub struct Server {
    config: ServerConfig,
    events: Arc<EventQueue>,
    running: Option<Running>,
}

struct Running {
    commands: Sender<Command>,
    waker: Waker,
    stopped: Arc<AtomicBool>,
    local_addr: SocketAddr,
    worker: JoinHandle<()>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Creates a stopped server with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a stopped server with the given configuration.
    #[must_use]
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            events: Arc::new(EventQueue::new()),
            running: None,
        }
    }

    /// Binds `ip:port` (dotted-quad IPv4) and starts the worker thread.
    ///
    /// Port 0 asks the OS for a free port; see
    /// [`local_addr`](Self::local_addr).
    pub fn start(&mut self, ip: &str, port: u16) -> Result<(), StartError> {
        if self.running.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| StartError::InvalidAddress(ip.to_string()))?;
        let listener = TcpListener::bind(SocketAddrV4::new(ip, port))?;
        let local_addr = listener.local_addr()?;

        let stopped = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::channel();
        let (reactor, waker) = Reactor::new(
            listener,
            Arc::clone(&self.events),
            command_rx,
            Arc::clone(&stopped),
            self.config.clone(),
        )?;

        let worker = std::thread::Builder::new()
            .name("websock-reactor".to_string())
            .spawn(move || reactor.run())?;

        self.running = Some(Running {
            commands,
            waker,
            stopped,
            local_addr,
            worker,
        });
        debug!(%local_addr, "server started");
        Ok(())
    }

    /// The bound listener address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Stops the server and joins the worker thread. Idempotent.
    ///
    /// Connections are closed without `Disconnect` events; whatever was
    /// already queued remains pollable.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.stopped.store(true, Ordering::SeqCst);
        if running.commands.send(Command::Stop).is_ok() {
            let _ = running.waker.wake();
        }
        if running.worker.join().is_err() {
            warn!("reactor thread panicked");
        }
    }

    /// Queues a text message for `id`.
    ///
    /// Non-blocking. An id unknown by the time the reactor runs the task
    /// is silently ignored; a payload over [`MAX_MESSAGE_LEN`] bytes is
    /// rejected here and the connection stays open.
    pub fn send_text(
        &self,
        id: ConnectionId,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), SendError> {
        self.send(id, Opcode::Text, payload.into())
    }

    /// Queues a binary message for `id`. Same rules as
    /// [`send_text`](Self::send_text).
    pub fn send_binary(
        &self,
        id: ConnectionId,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), SendError> {
        self.send(id, Opcode::Binary, payload.into())
    }

    fn send(&self, id: ConnectionId, opcode: Opcode, payload: Vec<u8>) -> Result<(), SendError> {
        let size = payload.len() as u64;
        if size > MAX_MESSAGE_LEN {
            return Err(SendError::MessageTooLong { size });
        }
        self.post(Command::Send {
            id,
            opcode,
            payload,
        })
    }

    /// Asks the reactor to drop a connection. Non-blocking; unknown ids
    /// and a stopped server are silently ignored.
    pub fn drop_connection(&self, id: ConnectionId) {
        let _ = self.post(Command::Drop(id));
    }

    /// Removes and returns the oldest pending event, never blocking.
    #[must_use]
    pub fn poll(&self) -> Option<Event> {
        self.events.poll()
    }

    fn post(&self, command: Command) -> Result<(), SendError> {
        let Some(running) = &self.running else {
            return Err(SendError::NotRunning);
        };
        if running.commands.send(command).is_ok() {
            let _ = running.waker.wake();
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
