//! Protocol module containing the frame codec and the Upgrade handshake.

pub mod frame;
pub mod handshake;

pub use frame::{decode_frame, encode_frame, encode_text_frame, Frame, FrameError, Opcode};
pub use handshake::{compute_accept_key, parse_upgrade_request, HandshakeError, UpgradeRequest};
