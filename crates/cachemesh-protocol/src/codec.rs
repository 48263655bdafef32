//! Length-delimited frame codec for TCP links.
//!
//! Wire format: 1-byte command + 4-byte big-endian length + payload bytes.
//! Several frames share one stream; the length prefix keeps them apart.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Charset, Command, Message};
use crate::{ProtocolError, FRAME_HEADER_BYTES, MAX_FRAME_BYTES};

/// One frame on a TCP link: an application message or a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, payload: Bytes) -> Self {
        Self { command, payload }
    }

    pub fn control(command: Command, payload: Bytes) -> Self {
        Self { command, payload }
    }

    pub fn heartbeat() -> Self {
        Self::control(Command::HEARTBEAT, Bytes::new())
    }

    pub fn is_control(&self) -> bool {
        self.command.is_control()
    }

    /// Reinterpret as a message; the receiving side picks the charset.
    pub fn into_message(self, charset: Charset) -> Message {
        Message::from_wire(self.command, self.payload, charset)
    }
}

impl From<&Message> for Frame {
    fn from(msg: &Message) -> Self {
        Self {
            command: msg.command(),
            payload: msg.payload().clone(),
        }
    }
}

/// Codec for framing `Frame` values over a byte stream.
///
/// A frame declaring more than `max_frame_bytes` is skipped, not fatal:
/// its body is consumed and dropped and decoding resumes at the next
/// header. Callers learn about skipped frames through [`take_discarded`].
///
/// [`take_discarded`]: FrameCodec::take_discarded
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Body bytes of an oversized frame still to be skipped.
    skipping: usize,
    discarded: Vec<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            skipping: 0,
            discarded: Vec::new(),
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Declared sizes of the oversized frames skipped since the last call.
    pub fn take_discarded(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.discarded)
    }

    pub fn is_skipping(&self) -> bool {
        self.skipping > 0
    }

    fn split_frame(&self, src: &mut BytesMut, length: usize) -> Option<Frame> {
        let total = FRAME_HEADER_BYTES + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return None;
        }

        let command = Command::from_code(src.get_u8());
        src.advance(4);
        let payload = src.split_to(length).freeze();
        Some(Frame { command, payload })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.skipping > 0 {
                let n = self.skipping.min(src.len());
                src.advance(n);
                self.skipping -= n;
                if self.skipping > 0 {
                    return Ok(None);
                }
            }

            if src.len() < FRAME_HEADER_BYTES {
                return Ok(None);
            }

            let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
            if length <= self.max_frame_bytes {
                return Ok(self.split_frame(src, length));
            }
            src.advance(FRAME_HEADER_BYTES);
            self.skipping = length;
            self.discarded.push(length);
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_frame_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size: item.payload.len(),
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(FRAME_HEADER_BYTES + item.payload.len());
        dst.put_u8(item.command.code());
        dst.put_u32(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
