//! Websock: an embeddable WebSocket server (RFC 6455, server role only).
//!
//! # Overview
//!
//! The crate accepts client TCP connections on a configured IPv4 endpoint,
//! performs the HTTP upgrade handshake, parses masked client frames, and
//! hands text/binary messages to the embedding application through a
//! non-blocking event queue. Outbound text/binary/close frames are
//! serialized and written back in order.
//!
//! All connection state lives on one worker thread running a readiness
//! loop; the thread-safe [`Server`] façade posts commands onto that loop
//! and never touches sockets itself.
//!
//! # Module Structure
//!
//! - [`frame`]: wire format: receive buffer, validation, unmasking,
//!   outbound serialization
//! - [`http`]: the slice of HTTP/1.1 the upgrade handshake consults
//! - [`handshake`]: upgrade validation and `Sec-WebSocket-Accept`
//! - [`event`]: events delivered to the application
//! - [`config`]: server tuning knobs
//! - [`error`]: façade error types
//! - `connection`, `reactor`, `server`: the concurrency core
//!
//! # Example
//!
//! ```no_run
//! use websock::{Event, Server};
//!
//! let mut server = Server::new();
//! server.start("127.0.0.1", 9000)?;
//!
//! loop {
//!     while let Some(event) = server.poll() {
//!         match event {
//!             Event::NewConnection(id) => println!("#{id} connected"),
//!             Event::Message(id, payload) => server.send_binary(id, payload)?,
//!             Event::Disconnect(id) => println!("#{id} gone"),
//!         }
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! }
//! # #[allow(unreachable_code)]
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Protocol limits
//!
//! Client frames must be final, masked, and carry at most 125 payload
//! bytes; anything else drops the connection. Server frames may carry up
//! to `u32::MAX` bytes. There is no fragmentation, extension, or TLS
//! support, and received Ping frames are not answered.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod http;

mod connection;
mod reactor;
mod server;

pub use config::ServerConfig;
pub use error::{SendError, StartError};
pub use event::{ConnectionId, Event};
pub use server::Server;
