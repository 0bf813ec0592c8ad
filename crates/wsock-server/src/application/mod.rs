//! Application layer for wsock-server.
//!
//! The application layer decides *what* to do with a message.  Sockets,
//! framing and task spawning are left to the infrastructure layer.
//!
//! # What does NOT belong here?
//!
//! - Opening sockets or listening for connections (that is infrastructure)
//! - WebSocket framing (handled by `wsock-core`)

pub mod echo;

pub use echo::{attach_echo, echo_reply, REPLY_PREFIX};
