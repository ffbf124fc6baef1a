//! Errors surfaced by the [`Server`](crate::Server) façade.
//!
//! Protocol violations and transport errors never appear here: the
//! reactor logs them and drops the offending connection, and the
//! application only observes the eventual
//! [`Disconnect`](crate::Event::Disconnect).

use crate::frame::MAX_MESSAGE_LEN;

/// Failures while starting the server.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// `start` was called while the server is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// The address string is not a dotted-quad IPv4 address.
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    /// Binding the listener or setting up the reactor failed.
    #[error("failed to start server: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of `send_text` / `send_binary`.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The payload exceeds the largest encodable frame
    /// ([`MAX_MESSAGE_LEN`] bytes). The connection stays open.
    #[error("message too long: {size} bytes (max: {MAX_MESSAGE_LEN})")]
    MessageTooLong {
        /// Offending payload size in bytes.
        size: u64,
    },

    /// The server is not running.
    #[error("server is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(StartError::AlreadyRunning.to_string(), "server is already running");
        assert!(StartError::InvalidAddress("nope".into())
            .to_string()
            .contains("nope"));

        let err = SendError::MessageTooLong { size: 1 << 33 };
        assert!(err.to_string().contains("8589934592"));
        assert_eq!(SendError::NotRunning.to_string(), "server is not running");
    }
}
