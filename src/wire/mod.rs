//! Wire format: stream framing plus the CBOR message codec.

pub mod frame;
pub mod message;

use thiserror::Error;

pub use frame::{decode_frame, encode_frame, FRAME_HEADER_LEN};
pub use message::{decode_message, encode_message, Message, WireMessage};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame is {got} bytes, cap is {max}")]
    FrameTooLarge { got: usize, max: usize },
    #[error("frame checksum mismatch")]
    ChecksumMismatch,
    #[error("message decode: {0}")]
    Decode(String),
    #[error("message encode: {0}")]
    Encode(String),
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("duplicate body key {0}")]
    DuplicateField(u32),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

impl WireError {
    pub fn transience(&self) -> crate::Transience {
        // Wire-level failures are per-message; the peer connection itself may
        // still be usable.
        crate::Transience::Permanent
    }
}
