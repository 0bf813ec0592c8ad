//! Domain layer for wsock-server.
//!
//! Pure types with no dependency on sockets, tasks or the file system:
//! configuration values and the connection lifecycle.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or channel types
//! - File I/O or environment variable reading

pub mod config;
pub mod connection;

pub use config::{ConnectionLimits, ServerConfig};
pub use connection::{ConnectionId, ConnectionState};
