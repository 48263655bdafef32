//! Cachemesh Protocol -- node identity, wire messages, frame and datagram codecs.
//!
//! TCP links carry `[1-byte command][4-byte BE length][payload]` frames.
//! Multicast datagrams carry `[1-byte command][16-byte sender id][4-byte BE length][payload]`,
//! one message per datagram.

pub mod codec;
pub mod datagram;
pub mod messages;
pub mod timing;

pub use codec::{Frame, FrameCodec};
pub use datagram::Datagram;
pub use messages::*;
pub use timing::{TimingProfile, DEFAULT_TIMING};

/// Maximum TCP frame payload: 16 MB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// TCP frame header: command byte + length prefix.
pub const FRAME_HEADER_BYTES: usize = 1 + 4;

/// Multicast datagram header: command byte + sender id + length prefix.
pub const DATAGRAM_HEADER_BYTES: usize = 1 + 16 + 4;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("command {0:#04x} is reserved for transport control")]
    ReservedCommand(u8),
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("length mismatch: header declares {declared} bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("character {ch:?} cannot be encoded as {charset}")]
    Unencodable { ch: char, charset: Charset },
    #[error("payload is not valid {charset}")]
    Undecodable { charset: Charset },
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
    #[error("malformed handshake: {0}")]
    Handshake(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
