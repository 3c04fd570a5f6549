//! Bitswarm wire format: stream framing, protocol tokens, and the stream
//! preface.
//!
//! Every exchange stream carries a sequence of frames. A frame is a LEB128
//! length followed by that many bytes. Frames whose body starts with `/`
//! and ends with `\n` are protocol tokens; `na\n` is the refusal token;
//! anything else is a message payload.
//!
//! ```text
//! initiator → responder:  /multistream/1.0.0  /bitswarm/1.2.0  <payload>  (half-close)
//! responder → initiator:  /multistream/1.0.0  /bitswarm/1.2.0             (close)
//! ```
//!
//! A responder that does not speak the requested protocol answers `na`.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::varint::{decode_uvarint, encode_uvarint};

// ── Protocol tokens ───────────────────────────────────────────────────────────

/// Stream multiplexing marker, always negotiated first.
pub const STREAM_PROTOCOL: &str = "/multistream/1.0.0";

/// Block exchange protocol marker.
pub const EXCHANGE_PROTOCOL: &str = "/bitswarm/1.2.0";

/// Refusal token body (without the trailing newline).
pub const REFUSED: &str = "na";

// ── Limits ────────────────────────────────────────────────────────────────────

/// Largest token frame accepted. Tokens are short ASCII paths.
pub const MAX_TOKEN_LEN: usize = 1000;

/// Largest block the exchange will carry.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Largest payload frame accepted. Room for a few max-size blocks plus
/// hex and JSON overhead.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound on the bytes a responder sends back during negotiation.
pub const MAX_NEGOTIATION_REPLY: usize = 4 * MAX_TOKEN_LEN;

// ── Frames ────────────────────────────────────────────────────────────────────

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A protocol token, without its trailing newline.
    Token(String),
    /// The `na` refusal.
    Refused,
    /// A message payload.
    Payload(Bytes),
}

impl Frame {
    /// Short form for errors and logs. Payloads are summarised by length.
    pub fn describe(&self) -> String {
        match self {
            Frame::Token(t) => format!("token {t}"),
            Frame::Refused => "refusal".to_string(),
            Frame::Payload(body) => format!("{}-byte payload", body.len()),
        }
    }
}

/// Encode a protocol token frame.
pub fn token_frame(token: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(token.len() + 2);
    encode_uvarint(token.len() as u64 + 1, &mut out);
    out.extend_from_slice(token.as_bytes());
    out.push(b'\n');
    out
}

/// Encode the refusal frame.
pub fn refusal_frame() -> Vec<u8> {
    token_frame(REFUSED)
}

/// Length-prefix a payload.
pub fn payload_frame(body: &[u8]) -> Result<Vec<u8>, WireError> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    encode_uvarint(body.len() as u64, &mut out);
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a fully-read stream into frames.
pub fn decode_frames(mut data: &[u8]) -> Result<Vec<Frame>, WireError> {
    let mut frames = Vec::new();

    while !data.is_empty() {
        let (len, used) = decode_uvarint(data)?;
        let len = usize::try_from(len).map_err(|_| WireError::FrameTooLarge(usize::MAX))?;
        if len > MAX_MESSAGE_SIZE {
            return Err(WireError::FrameTooLarge(len));
        }
        data = &data[used..];
        if data.len() < len {
            return Err(WireError::Truncated);
        }
        let (body, rest) = data.split_at(len);
        data = rest;
        frames.push(classify(body)?);
    }

    Ok(frames)
}

fn classify(body: &[u8]) -> Result<Frame, WireError> {
    let is_line = body.len() >= 2 && body[body.len() - 1] == b'\n';

    if is_line && body[0] == b'/' {
        if body.len() > MAX_TOKEN_LEN {
            return Err(WireError::FrameTooLarge(body.len()));
        }
        let token = std::str::from_utf8(&body[..body.len() - 1])
            .map_err(|_| WireError::InvalidToken)?;
        return Ok(Frame::Token(token.to_string()));
    }

    if is_line && &body[..body.len() - 1] == REFUSED.as_bytes() {
        return Ok(Frame::Refused);
    }

    Ok(Frame::Payload(Bytes::copy_from_slice(body)))
}

// ── Stream preface ────────────────────────────────────────────────────────────

/// Written by the initiator at the start of a raw byte stream (e.g. TCP)
/// that has no authenticated channel to tell the responder who is calling.
///
/// Wire size: 36 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct StreamPreface {
    /// Preface format version. Currently 0x01.
    pub version: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    /// The initiator's peer identity.
    pub peer_id: [u8; 32],
    /// Port the initiator accepts streams on, big-endian. Zero if none.
    pub listen_port: [u8; 2],
}

assert_eq_size!(StreamPreface, [u8; 36]);

/// Current preface version.
pub const PREFACE_VERSION: u8 = 0x01;

/// Size of [`StreamPreface`] on the wire.
pub const PREFACE_LEN: usize = 36;

impl StreamPreface {
    pub fn new(peer_id: [u8; 32], listen_port: u16) -> Self {
        Self {
            version: PREFACE_VERSION,
            flags: 0,
            peer_id,
            listen_port: listen_port.to_be_bytes(),
        }
    }

    pub fn listen_port(&self) -> u16 {
        u16::from_be_bytes(self.listen_port)
    }

    /// Parse and validate a preface.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let preface = Self::read_from(bytes).ok_or(WireError::Truncated)?;
        if preface.version != PREFACE_VERSION {
            return Err(WireError::UnknownVersion(preface.version));
        }
        if preface.flags != 0 {
            return Err(WireError::ReservedFlagsSet(preface.flags));
        }
        Ok(preface)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("input ended mid-value")]
    Truncated,

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("varint is not minimally encoded")]
    VarintNotMinimal,

    #[error("frame length {0} exceeds maximum {}", MAX_MESSAGE_SIZE)]
    FrameTooLarge(usize),

    #[error("block of {0} bytes exceeds maximum {}", MAX_BLOCK_SIZE)]
    BlockTooLarge(usize),

    #[error("protocol token is not valid UTF-8")]
    InvalidToken,

    #[error("unsupported CID version: {0}")]
    UnsupportedCidVersion(u8),

    #[error("unknown codec: 0x{0:x}")]
    UnknownCodec(u64),

    #[error("unknown hash function: 0x{0:x}")]
    UnknownHash(u64),

    #[error("invalid CID: {0}")]
    InvalidCid(&'static str),

    #[error("unknown preface version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("malformed payload: {0}")]
    Payload(String),
}
