//! WebSocket frame codec (RFC 6455 section 5).
//!
//! Wire format:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//! All multi-byte integers are big-endian.
//!
//! # Asymmetry (for beginners)
//!
//! Frames sent by a browser to the server are always *masked*: the payload is
//! XOR-ed with a random 4-byte key that travels in the header.  Frames sent
//! by the server are never masked.  [`decode_frame`] therefore handles the
//! masking key, while [`encode_frame`] always writes the mask bit as 0.
//! [`encode_client_frame`] produces the masked client form and exists for
//! tests and tooling that play the browser's role.

use thiserror::Error;
use tracing::trace;

/// FIN flag in the first header byte.
pub const FIN_BIT: u8 = 0x80;

/// MASK flag in the second header byte.
pub const MASK_BIT: u8 = 0x80;

/// First header byte of a final (unfragmented) text frame.
pub const FINAL_TEXT_BYTE: u8 = FIN_BIT | 0x01;

/// Largest payload length that fits directly in the 7-bit length field.
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// 7-bit length marker announcing a 16-bit extended length.
const LEN_MARKER_16: u8 = 126;

/// 7-bit length marker announcing a 64-bit extended length.
const LEN_MARKER_64: u8 = 127;

/// Errors that can occur while decoding a frame or interpreting its payload.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// The buffer does not yet hold the whole frame.  Read more bytes and retry.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    Incomplete { needed: usize, available: usize },

    /// A 64-bit extended length with the most significant bit set.
    #[error("invalid 64-bit payload length 0x{0:016X}: most significant bit must be 0")]
    InvalidLength(u64),

    /// The declared payload is larger than the caller is willing to buffer.
    ///
    /// `frame_len` is the full size of the frame on the wire (header, masking
    /// key and payload), saturated at `u64::MAX`.
    #[error("payload of {len} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge { len: u64, max: u64, frame_len: u64 },

    /// Anything other than a final text frame (first byte `0x81`).
    #[error("unsupported frame: first byte 0x{0:02X}")]
    Unsupported(u8),

    /// A client frame arrived without a masking key.
    #[error("client frame is not masked")]
    NotMasked,

    /// The unmasked payload is not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl FrameError {
    /// Number of bytes to drop from the front of the stream to get past a
    /// frame that was refused without being buffered.
    ///
    /// Returns `None` for errors that are not about the frame's size.  A
    /// 64-bit length with the MSB set can never be satisfied, so everything
    /// that follows belongs to that frame.
    pub fn discard_len(&self) -> Option<u64> {
        match self {
            Self::PayloadTooLarge { frame_len, .. } => Some(*frame_len),
            Self::InvalidLength(_) => Some(u64::MAX),
            _ => None,
        }
    }
}

// ── Frame model ───────────────────────────────────────────────────────────────

/// The 4-bit frame type carried in the low nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// One of the reserved values 0x3–0x7 or 0xB–0xF.
    Reserved(u8),
}

impl Opcode {
    /// Interprets the low nibble of `bits`.  Higher bits are ignored.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Returns the 4-bit wire value.
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(bits) => bits & 0x0F,
        }
    }

    /// Returns `true` for Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One decoded WebSocket frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// `true` if this is the final fragment of a message.
    pub fin: bool,
    /// The three RSV bits (always 0 without negotiated extensions).
    pub rsv: u8,
    /// Frame type.
    pub opcode: Opcode,
    /// Masking key as received, `None` for unmasked (server) frames.
    pub mask_key: Option<[u8; 4]>,
    /// Payload bytes after unmasking.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Returns `true` if the frame carried a masking key.
    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    /// Reassembles the first header byte (FIN, RSV and opcode).
    pub fn first_byte(&self) -> u8 {
        let fin = if self.fin { FIN_BIT } else { 0 };
        fin | ((self.rsv & 0x07) << 4) | self.opcode.bits()
    }

    /// Interprets a client frame as a complete text message.
    ///
    /// Only a final, unfragmented text frame (first byte `0x81`) that was
    /// masked by the client is accepted.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Unsupported`] for any other first byte (binary,
    ///   continuation, control frames, RSV bits set, non-final text).
    /// - [`FrameError::NotMasked`] if the client did not mask the payload.
    /// - [`FrameError::InvalidUtf8`] if the payload is not UTF-8.
    pub fn into_text(self) -> Result<String, FrameError> {
        let first = self.first_byte();
        if first != FINAL_TEXT_BYTE {
            return Err(FrameError::Unsupported(first));
        }
        if !self.is_masked() {
            return Err(FrameError::NotMasked);
        }
        Ok(String::from_utf8(self.payload)?)
    }
}

/// Which of the three payload length encodings a frame uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthForm {
    /// 0–125: the length sits in the 7-bit field.
    Short,
    /// 126–65 535: marker 126 followed by a 16-bit length.
    Extended16,
    /// Larger: marker 127 followed by a 64-bit length.
    Extended64,
}

impl LengthForm {
    /// Picks the smallest encoding able to express `len`.
    pub fn for_len(len: usize) -> Self {
        if len <= MAX_SHORT_PAYLOAD {
            Self::Short
        } else if len <= u16::MAX as usize {
            Self::Extended16
        } else {
            Self::Extended64
        }
    }

    /// Header size in bytes for an unmasked frame using this form.
    pub fn header_len(self) -> usize {
        match self {
            Self::Short => 2,
            Self::Extended16 => 4,
            Self::Extended64 => 10,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes it occupied so the caller can
/// advance its read cursor.  Bytes after the frame are left untouched, which
/// is how several frames coalesced into one TCP read are handled.
///
/// `max_payload` caps the declared payload length.  A peer could otherwise
/// announce a 2^62-byte frame and make the caller buffer forever.
///
/// # Errors
///
/// - [`FrameError::Incomplete`] if the header or payload has not fully
///   arrived yet.  This is the normal "read more" signal.
/// - [`FrameError::InvalidLength`] for a 64-bit length with the MSB set.
/// - [`FrameError::PayloadTooLarge`] if the declared length exceeds `max_payload`.
///
/// # Examples
///
/// ```rust
/// use wsock_core::{decode_frame, Opcode};
///
/// // RFC 6455 section 5.7: a single-frame masked text message "Hello".
/// let bytes = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
/// let (frame, consumed) = decode_frame(&bytes, 1024).unwrap();
/// assert_eq!(frame.opcode, Opcode::Text);
/// assert_eq!(frame.payload, b"Hello");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn decode_frame(bytes: &[u8], max_payload: u64) -> Result<(Frame, usize), FrameError> {
    require_len(bytes, 2)?;

    let fin = bytes[0] & FIN_BIT != 0;
    let rsv = (bytes[0] >> 4) & 0x07;
    let opcode = Opcode::from_bits(bytes[0]);
    let masked = bytes[1] & MASK_BIT != 0;

    let (declared_len, mut offset) = match bytes[1] & 0x7F {
        LEN_MARKER_16 => {
            require_len(bytes, 4)?;
            (u64::from(u16::from_be_bytes([bytes[2], bytes[3]])), 4)
        }
        LEN_MARKER_64 => {
            require_len(bytes, 10)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(FrameError::InvalidLength(len));
            }
            (len, 10)
        }
        short => (u64::from(short), 2),
    };

    let header_len = offset + if masked { 4 } else { 0 };
    let too_large = || FrameError::PayloadTooLarge {
        len: declared_len,
        max: max_payload,
        frame_len: declared_len.saturating_add(header_len as u64),
    };

    if declared_len > max_payload {
        return Err(too_large());
    }

    let mask_key = if masked {
        require_len(bytes, offset + 4)?;
        let key = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = usize::try_from(declared_len).map_err(|_| too_large())?;
    let total = offset.checked_add(payload_len).ok_or_else(too_large)?;
    require_len(bytes, total)?;

    let mut payload = bytes[offset..total].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, &key);
    }

    trace!(
        fin,
        opcode = ?opcode,
        masked,
        payload_len,
        "decoded frame"
    );

    Ok((
        Frame {
            fin,
            rsv,
            opcode,
            mask_key,
            payload,
        },
        total,
    ))
}

/// Encodes an unmasked server frame.
///
/// The length field uses the smallest of the three encodings (see
/// [`LengthForm`]), so the output is exactly `header_len + payload.len()`
/// bytes long.
pub fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool) -> Vec<u8> {
    let form = LengthForm::for_len(payload.len());
    let mut buf = Vec::with_capacity(form.header_len() + payload.len());

    buf.push(if fin { FIN_BIT } else { 0 } | opcode.bits());
    write_length(&mut buf, form, payload.len(), 0);
    buf.extend_from_slice(payload);
    buf
}

/// Encodes `text` as a single final, unmasked text frame (first byte `0x81`).
///
/// # Examples
///
/// ```rust
/// use wsock_core::encode_text_frame;
///
/// assert_eq!(encode_text_frame("Hi"), vec![0x81, 0x02, b'H', b'i']);
/// ```
pub fn encode_text_frame(text: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, text.as_bytes(), true)
}

/// Encodes a masked frame the way a client (browser) would.
///
/// The server never sends these; they are produced by test clients and
/// diagnostic tooling.
pub fn encode_client_frame(opcode: Opcode, payload: &[u8], fin: bool, mask_key: [u8; 4]) -> Vec<u8> {
    let form = LengthForm::for_len(payload.len());
    let mut buf = Vec::with_capacity(form.header_len() + 4 + payload.len());

    buf.push(if fin { FIN_BIT } else { 0 } | opcode.bits());
    write_length(&mut buf, form, payload.len(), MASK_BIT);
    buf.extend_from_slice(&mask_key);

    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start..], &mask_key);
    buf
}

/// XORs `payload[i]` with `mask_key[i % 4]` in place.
///
/// The operation is its own inverse: masking twice restores the original.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(bytes: &[u8], needed: usize) -> Result<(), FrameError> {
    if bytes.len() < needed {
        Err(FrameError::Incomplete {
            needed,
            available: bytes.len(),
        })
    } else {
        Ok(())
    }
}

fn write_length(buf: &mut Vec<u8>, form: LengthForm, len: usize, mask_bit: u8) {
    match form {
        LengthForm::Short => buf.push(mask_bit | len as u8),
        LengthForm::Extended16 => {
            buf.push(mask_bit | LEN_MARKER_16);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        LengthForm::Extended64 => {
            buf.push(mask_bit | LEN_MARKER_64);
            buf.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
