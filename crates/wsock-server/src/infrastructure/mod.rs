//! Infrastructure layer for wsock-server.
//!
//! Everything that touches the network or the file system lives here.
//!
//! # Responsibilities
//!
//! - Resolving the listening address and binding the TCP listener
//! - Running the accept loop and spawning one task per connection
//! - Performing the HTTP Upgrade handshake and the frame read/write loop
//! - Loading the TOML config file
//!
//! # What does NOT belong here?
//!
//! - Frame and handshake byte formats (those are in `wsock-core`)
//! - What to do with a message once it arrives (that is the application layer)

pub mod address;
pub mod config_file;
pub mod connection;
pub mod server;

pub use connection::{Connection, ConnectionError, MessageObserver};
pub use server::{ConnectObserver, Server, ServerError};
