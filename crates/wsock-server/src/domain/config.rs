//! Server configuration types.
//!
//! [`ServerConfig`] is the single source of truth for all runtime settings.
//! It can be built from CLI arguments and an optional TOML file (see
//! `infrastructure::config_file`) or from defaults (useful for tests).
//!
//! Keeping configuration as a plain struct (no global state, no environment
//! reads inside the domain) makes the server easy to embed in tests and in
//! host applications.

use std::net::{IpAddr, SocketAddr};

/// Default listening port (plain HTTP).
pub const DEFAULT_PORT: u16 = 80;

/// Largest outbound text message accepted by `Connection::send`, in UTF-8 bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_535;

/// Largest inbound frame payload the server will buffer.
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Largest Upgrade request (request line + headers) the server will buffer.
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Size of the scratch buffer handed to each socket `read()`.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024;

/// Frames that may wait in a connection's outbound queue before `send`
/// reports backpressure.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Per-connection limits, copied into every connection at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Outbound messages longer than this fail with `MessageTooLong`.
    pub max_message_size: usize,
    /// Inbound frames declaring a longer payload are dropped unread.
    pub max_frame_size: u64,
    /// Pre-handshake bytes beyond this are discarded.
    pub max_handshake_size: usize,
    /// Bytes requested per `read()` call.
    pub read_buffer_size: usize,
    /// Capacity of the outbound frame queue.
    pub outbound_queue_size: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
        }
    }
}

/// All runtime configuration for the WebSocket server.
///
/// # Example
///
/// ```rust
/// use wsock_server::domain::ServerConfig;
///
/// let cfg = ServerConfig::default();
/// assert_eq!(cfg.port, 80);
/// assert!(cfg.bind_address.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to.  `None` means "the first local IPv4 interface
    /// address", resolved when the server starts.
    pub bind_address: Option<IpAddr>,

    /// TCP port to listen on.  `0` lets the OS pick a free port.
    pub port: u16,

    /// Limits applied to every accepted connection.
    pub limits: ConnectionLimits,
}

impl ServerConfig {
    /// Returns a config bound to an explicit address and port, with default limits.
    pub fn with_address(ip: IpAddr, port: u16) -> Self {
        Self {
            bind_address: Some(ip),
            port,
            limits: ConnectionLimits::default(),
        }
    }

    /// Returns the explicit socket address, if one was configured.
    pub fn explicit_socket_addr(&self) -> Option<SocketAddr> {
        self.bind_address.map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    /// | Field                      | Default      |
    /// |----------------------------|--------------|
    /// | bind_address               | resolved     |
    /// | port                       | 80           |
    /// | limits.max_message_size    | 65 535       |
    /// | limits.max_frame_size      | 16 MiB       |
    /// | limits.max_handshake_size  | 8 KiB        |
    /// | limits.read_buffer_size    | 4 KiB        |
    /// | limits.outbound_queue_size | 1 024 frames |
    fn default() -> Self {
        Self {
            bind_address: None,
            port: DEFAULT_PORT,
            limits: ConnectionLimits::default(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_is_80() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 80);
    }

    #[test]
    fn test_default_bind_address_is_resolved_later() {
        let cfg = ServerConfig::default();
        assert!(cfg.bind_address.is_none());
        assert!(cfg.explicit_socket_addr().is_none());
    }

    #[test]
    fn test_default_max_message_size_is_65535() {
        assert_eq!(ConnectionLimits::default().max_message_size, 65_535);
    }

    #[test]
    fn test_with_address_keeps_default_limits() {
        let cfg = ServerConfig::with_address("127.0.0.1".parse().unwrap(), 8989);

        assert_eq!(
            cfg.explicit_socket_addr(),
            Some("127.0.0.1:8989".parse().unwrap())
        );
        assert_eq!(cfg.limits, ConnectionLimits::default());
    }
}
