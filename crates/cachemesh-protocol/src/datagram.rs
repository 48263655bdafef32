//! Multicast datagram codec: one datagram carries exactly one message.
//!
//! Wire format: 1-byte command + 16-byte sender id + 4-byte BE length + payload.
//! Payloads that would not fit the configured datagram size are refused,
//! never fragmented.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::messages::{Command, NodeId};
use crate::{ProtocolError, Result, DATAGRAM_HEADER_BYTES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub command: Command,
    pub sender: NodeId,
    pub payload: Bytes,
}

impl Datagram {
    pub fn new(command: Command, sender: NodeId, payload: Bytes) -> Self {
        Self {
            command,
            sender,
            payload,
        }
    }

    /// Largest payload that fits a datagram of `max_datagram_bytes`.
    pub fn max_payload(max_datagram_bytes: usize) -> usize {
        max_datagram_bytes.saturating_sub(DATAGRAM_HEADER_BYTES)
    }

    pub fn encoded_len(&self) -> usize {
        DATAGRAM_HEADER_BYTES + self.payload.len()
    }

    pub fn encode(&self, max_datagram_bytes: usize) -> Result<Bytes> {
        let len = self.encoded_len();
        if len > max_datagram_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: max_datagram_bytes,
            });
        }
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.command.code());
        buf.put_slice(self.sender.as_bytes());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < DATAGRAM_HEADER_BYTES {
            return Err(ProtocolError::Truncated {
                what: "datagram header",
                need: DATAGRAM_HEADER_BYTES,
                have: buf.len(),
            });
        }
        let command = Command::from_code(buf.get_u8());
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let declared = buf.get_u32() as usize;
        if declared != buf.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        Ok(Self {
            command,
            sender: NodeId::from_bytes(id),
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
