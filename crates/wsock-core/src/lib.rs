//! # wsock-core
//!
//! Wire-level building blocks for a server-side WebSocket implementation:
//! the RFC 6455 frame codec and the HTTP/1.1 Upgrade handshake.
//!
//! This crate performs no I/O.  Every function takes a byte slice (or a
//! string) and returns bytes or a typed result, which keeps the protocol logic
//! testable without sockets and lets the server crate decide how bytes are
//! read and written.
//!
//! # Architecture overview (for beginners)
//!
//! A WebSocket connection starts life as an ordinary HTTP request.  The
//! client sends `GET / HTTP/1.1` with an `Upgrade: websocket` header and a
//! random `Sec-WebSocket-Key`.  The server answers `101 Switching Protocols`
//! with a token derived from that key.  From then on both sides exchange
//! *frames*: a small binary header followed by a payload.
//!
//! - **`protocol::handshake`** – Recognises the Upgrade request, extracts the
//!   key, computes the accept token and builds the 101 response.
//!
//! - **`protocol::frame`** – Decodes frames arriving from clients (which are
//!   always masked) and encodes frames sent by the server (never masked).

pub mod protocol;

// Re-export the most-used items at the crate root so callers can write
// `wsock_core::decode_frame` instead of the full module path.
pub use protocol::frame::{
    apply_mask, decode_frame, encode_client_frame, encode_frame, encode_text_frame, Frame,
    FrameError, LengthForm, Opcode,
};
pub use protocol::handshake::{
    compute_accept_key, parse_upgrade_request, upgrade_response, HandshakeError, UpgradeRequest,
    WS_GUID,
};
