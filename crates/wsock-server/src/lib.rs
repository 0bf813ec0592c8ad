//! wsock-server library crate.
//!
//! A WebSocket server over raw TCP: it performs the HTTP Upgrade handshake
//! itself, decodes client frames with `wsock-core`, and hands decoded text to
//! application callbacks.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! WebSocket client (masked text frames)
//!         ↕  TCP
//! [wsock-server]
//!   ├── domain/           ServerConfig, ConnectionLimits, ConnectionState
//!   ├── application/      Echo consumer
//!   └── infrastructure/
//!         ├── server/      Accept loop, connect observers, live set
//!         ├── connection/  Per-connection task: handshake, decode, dispatch, write
//!         ├── address/     Local IPv4 resolution
//!         └── config_file/ TOML config
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` registers callbacks through the `infrastructure` handles.
//! - `infrastructure` depends on `domain`, `wsock-core` and `tokio`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use wsock_server::application::attach_echo;
//! use wsock_server::domain::ServerConfig;
//! use wsock_server::infrastructure::Server;
//!
//! # async fn run() -> Result<(), wsock_server::infrastructure::ServerError> {
//! let server = Server::bind(ServerConfig::with_address("127.0.0.1".parse().unwrap(), 8989)).await?;
//! attach_echo(&server);
//! # Ok(())
//! # }
//! ```

/// Domain layer: configuration and lifecycle types (no I/O).
pub mod domain;

/// Application layer: what to do with inbound messages.
pub mod application;

/// Infrastructure layer: TCP listener, connection tasks and config file.
pub mod infrastructure;

pub use domain::{ConnectionId, ConnectionLimits, ConnectionState, ServerConfig};
pub use infrastructure::{Connection, ConnectionError, Server, ServerError};
