//! Server tuning knobs.

/// Configuration for a [`Server`](crate::Server).
///
/// Built with consuming setters:
///
/// ```
/// use websock::ServerConfig;
///
/// let config = ServerConfig::new().nodelay(true).max_handshake_bytes(4096);
/// assert_eq!(config.max_handshake_bytes, 4096);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cap on the buffered upgrade request; a client that exceeds it
    /// without finishing its headers is answered 400 and closed.
    pub max_handshake_bytes: usize,
    /// Size of the readiness event buffer per poll.
    pub events_capacity: usize,
    /// Whether to set `TCP_NODELAY` on accepted sockets.
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_handshake_bytes: 8192,
            events_capacity: 128,
            nodelay: false,
        }
    }
}

impl ServerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the upgrade-request size cap.
    #[must_use]
    pub fn max_handshake_bytes(mut self, bytes: usize) -> Self {
        self.max_handshake_bytes = bytes;
        self
    }

    /// Sets the readiness event buffer size.
    #[must_use]
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    /// Sets `TCP_NODELAY` on accepted sockets.
    #[must_use]
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ServerConfig::new()
            .max_handshake_bytes(1024)
            .events_capacity(16)
            .nodelay(true);
        assert_eq!(config.max_handshake_bytes, 1024);
        assert_eq!(config.events_capacity, 16);
        assert!(config.nodelay);
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_handshake_bytes, 8192);
        assert_eq!(config.events_capacity, 128);
        assert!(!config.nodelay);
    }
}
