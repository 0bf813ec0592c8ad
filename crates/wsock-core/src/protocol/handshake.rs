//! HTTP/1.1 Upgrade handshake (RFC 6455 section 4.2).
//!
//! The first bytes a browser sends on a fresh WebSocket connection are a
//! plain HTTP request:
//!
//! ```text
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! The server proves it understood the request by hashing the key together
//! with a fixed GUID and sending the result back in `Sec-WebSocket-Accept`.
//!
//! # Why so lenient?
//!
//! Only the `GET` request line and the `Sec-WebSocket-Key` header are
//! checked.  A request that fails either check is reported as an error so
//! the caller can discard it and keep waiting; nothing is sent back to the
//! peer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Marks the end of the HTTP header block.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors returned while recognising an Upgrade request.
#[derive(Debug, Error, PartialEq)]
pub enum HandshakeError {
    /// The buffer starts like a `GET` request but the header block has not
    /// fully arrived.  Read more bytes and retry.
    #[error("incomplete upgrade request ({available} bytes buffered)")]
    Incomplete { available: usize },

    /// The bytes are not an HTTP `GET` request.
    #[error("not an HTTP GET request")]
    NotGetRequest,

    /// The header block is complete but not valid UTF-8.
    #[error("upgrade request header block is not valid UTF-8")]
    Malformed { consumed: usize },

    /// The header block is complete but has no usable `Sec-WebSocket-Key`.
    #[error("upgrade request has no Sec-WebSocket-Key header")]
    MissingKey { consumed: usize },
}

/// A recognised Upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request target from the request line (e.g. `/chat`).
    pub path: String,
    /// Trimmed value of the `Sec-WebSocket-Key` header.
    pub key: String,
    /// Length of the request including the blank line.  Bytes after this
    /// offset already belong to the WebSocket stream.
    pub consumed: usize,
}

impl UpgradeRequest {
    /// Computes the `Sec-WebSocket-Accept` token for this request.
    pub fn accept_key(&self) -> String {
        compute_accept_key(&self.key)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Computes `base64(SHA-1(client_key + WS_GUID))`.
///
/// # Examples
///
/// ```rust
/// use wsock_core::compute_accept_key;
///
/// // Test vector from RFC 6455 section 1.3.
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Recognises an Upgrade request at the start of `bytes`.
///
/// # Errors
///
/// - [`HandshakeError::NotGetRequest`] if the buffer does not start with `GET`.
/// - [`HandshakeError::Incomplete`] if the header terminator has not arrived.
/// - [`HandshakeError::Malformed`] / [`HandshakeError::MissingKey`] if the
///   complete request cannot be used.  Both carry the request length so the
///   caller can drop exactly those bytes.
pub fn parse_upgrade_request(bytes: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    const METHOD: &[u8] = b"GET";

    if bytes.len() < METHOD.len() {
        // "G" or "GE" could still become "GET".
        return if METHOD.starts_with(bytes) {
            Err(HandshakeError::Incomplete {
                available: bytes.len(),
            })
        } else {
            Err(HandshakeError::NotGetRequest)
        };
    }
    if !bytes.starts_with(METHOD) {
        return Err(HandshakeError::NotGetRequest);
    }

    let header_end = find_subslice(bytes, HEADER_TERMINATOR).ok_or(HandshakeError::Incomplete {
        available: bytes.len(),
    })?;
    let consumed = header_end + HEADER_TERMINATOR.len();

    let head = std::str::from_utf8(&bytes[..header_end])
        .map_err(|_| HandshakeError::Malformed { consumed })?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let key = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Sec-WebSocket-Key"))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or(HandshakeError::MissingKey { consumed })?
        .to_string();

    Ok(UpgradeRequest {
        path,
        key,
        consumed,
    })
}

/// Builds the `101 Switching Protocols` response for `accept_key`.
///
/// Every line ends with CRLF and the block is terminated by an empty line.
pub fn upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
