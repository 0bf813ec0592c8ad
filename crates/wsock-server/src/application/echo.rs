//! Echo consumer: answers every text message with a prefixed copy.
//!
//! ```text
//! client ── "hello" ──▶ server
//! client ◀── "Got your message:hello" ── server
//! ```

use tracing::{debug, warn};

use crate::infrastructure::Server;

/// Prepended to every echoed message.
pub const REPLY_PREFIX: &str = "Got your message:";

/// Builds the reply for one inbound message.
pub fn echo_reply(message: &str) -> String {
    format!("{REPLY_PREFIX}{message}")
}

/// Registers the echo behaviour on every connection `server` accepts.
///
/// A reply that cannot be sent (for example because the prefixed text
/// exceeds the message size limit) is logged and dropped.
pub fn attach_echo(server: &Server) {
    server.on_connect(|conn| {
        debug!(conn_id = %conn.id(), "attaching echo observer");
        let reply_to = conn.clone();
        conn.on_message(move |message| {
            if let Err(e) = reply_to.send(&echo_reply(message)) {
                warn!(conn_id = %reply_to.id(), "echo reply not sent: {e}");
            }
        });
    });
}
