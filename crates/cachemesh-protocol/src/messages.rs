//! Wire message types: node identity, commands, charsets, messages.
//!
//! Application messages carry a 1-byte command and an opaque payload.
//! Commands `0xF0..=0xFF` belong to the transports (handshake, heartbeat, leave)
//! and never reach message handlers.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ProtocolError, Result};

// ============================================================================
// Node identity
// ============================================================================

/// Opaque cluster participant identifier (random v4 UUID per channel instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// First 8 hex digits, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtocolError::InvalidNodeId(format!("{s:?}: {e}")))
    }
}

/// A cluster participant: identity plus the address it is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.addr)
    }
}

// ============================================================================
// Commands
// ============================================================================

/// 1-byte command code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Command(u8);

impl Command {
    /// First code of the transport control range.
    pub const CONTROL_START: u8 = 0xF0;

    pub const HELLO: Command = Command(0xF0);
    pub const WELCOME: Command = Command(0xF1);
    pub const REJECT: Command = Command(0xF2);
    pub const HEARTBEAT: Command = Command(0xF3);
    pub const LEAVE: Command = Command(0xF4);

    /// Any code is representable; `Message::new` refuses control codes.
    pub const fn from_code(code: u8) -> Self {
        Self(code)
    }

    pub const fn code(self) -> u8 {
        self.0
    }

    pub const fn is_control(self) -> bool {
        self.0 >= Self::CONTROL_START
    }

    fn control_name(self) -> Option<&'static str> {
        match self {
            Command::HELLO => Some("hello"),
            Command::WELCOME => Some("welcome"),
            Command::REJECT => Some("reject"),
            Command::HEARTBEAT => Some("heartbeat"),
            Command::LEAVE => Some("leave"),
            _ => None,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.control_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#04x}", self.0),
        }
    }
}

// ============================================================================
// Charset
// ============================================================================

/// Text encoding for textual payloads. Fixed per cluster, never negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Charset {
    /// ISO-8859-1: one byte per character, every byte decodes.
    #[default]
    #[serde(alias = "iso-8859-1")]
    Latin1,
    #[serde(alias = "utf-8")]
    Utf8,
}

impl Charset {
    pub fn encode(self, text: &str) -> Result<Bytes> {
        match self {
            Charset::Latin1 => {
                let mut out = Vec::with_capacity(text.len());
                for ch in text.chars() {
                    let code = ch as u32;
                    if code > 0xFF {
                        return Err(ProtocolError::Unencodable { ch, charset: self });
                    }
                    out.push(code as u8);
                }
                Ok(Bytes::from(out))
            }
            Charset::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Charset::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            Charset::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| ProtocolError::Undecodable { charset: self }),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Charset::Latin1 => f.write_str("ISO-8859-1"),
            Charset::Utf8 => f.write_str("UTF-8"),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Outbound wire unit. Immutable once built; cloning shares the payload buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: Command,
    payload: Bytes,
    charset: Charset,
}

impl Message {
    /// Build an application message. Control commands are rejected.
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Result<Self> {
        if command.is_control() {
            return Err(ProtocolError::ReservedCommand(command.code()));
        }
        Ok(Self {
            command,
            payload: payload.into(),
            charset: Charset::default(),
        })
    }

    /// Build an application message from text encoded with `charset`.
    pub fn text(command: Command, text: &str, charset: Charset) -> Result<Self> {
        let payload = charset.encode(text)?;
        Ok(Self::new(command, payload)?.with_charset(charset))
    }

    /// Build a transport control message. Only transports should call this.
    pub fn control(command: Command, payload: impl Into<Bytes>) -> Self {
        debug_assert!(command.is_control(), "{command} is not a control command");
        Self {
            command,
            payload: payload.into(),
            charset: Charset::Latin1,
        }
    }

    /// Rebuild a message decoded off the wire, without the reserved-code check.
    pub fn from_wire(command: Command, payload: Bytes, charset: Charset) -> Self {
        Self {
            command,
            payload,
            charset,
        }
    }

    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode the payload as text using the message charset.
    pub fn payload_text(&self) -> Result<String> {
        self.charset.decode(&self.payload)
    }
}

/// Inbound wire unit: the message plus the node that sent it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    message: Message,
    sender: Node,
    received_at: SystemTime,
}

impl ReceivedMessage {
    pub fn new(message: Message, sender: Node) -> Self {
        Self {
            message,
            sender,
            received_at: SystemTime::now(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn sender(&self) -> &Node {
        &self.sender
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn command(&self) -> Command {
        self.message.command()
    }

    pub fn payload(&self) -> &Bytes {
        self.message.payload()
    }

    pub fn payload_text(&self) -> Result<String> {
        self.message.payload_text()
    }
}

// ============================================================================
// TCP handshake payloads
// ============================================================================

/// Payload of HELLO (dialer → acceptor) and WELCOME (acceptor → dialer).
///
/// Text form: `<node-id>;<listen-port>;<advertised-addr or empty>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub node_id: NodeId,
    pub listen_port: u16,
    pub advertised: Option<SocketAddr>,
}

impl Hello {
    pub fn to_payload(&self) -> Bytes {
        let advertised = self
            .advertised
            .map(|a| a.to_string())
            .unwrap_or_default();
        Bytes::from(format!("{};{};{}", self.node_id, self.listen_port, advertised))
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = Charset::Latin1.decode(payload)?;
        let mut parts = text.splitn(3, ';');
        let (Some(id), Some(port), Some(advertised)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::Handshake(format!(
                "expected 3 fields, got {text:?}"
            )));
        };
        let node_id: NodeId = id.parse()?;
        let listen_port = port
            .parse::<u16>()
            .map_err(|e| ProtocolError::Handshake(format!("bad listen port {port:?}: {e}")))?;
        let advertised = if advertised.is_empty() {
            None
        } else {
            Some(advertised.parse::<SocketAddr>().map_err(|e| {
                ProtocolError::Handshake(format!("bad advertised address {advertised:?}: {e}"))
            })?)
        };
        Ok(Self {
            node_id,
            listen_port,
            advertised,
        })
    }

    /// Address the sender can be dialed at, as seen from `observed` (the
    /// socket peer address). Falls back to the observed IP with the
    /// advertised listen port.
    pub fn dial_addr(&self, observed: SocketAddr) -> SocketAddr {
        match self.advertised {
            Some(addr) if !addr.ip().is_unspecified() => addr,
            _ => SocketAddr::new(observed.ip(), self.listen_port),
        }
    }
}

/// Why an acceptor refused a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The dialer reached its own listener.
    SelfConnection,
    /// Only the node with the smaller id initiates; the acceptor dials back.
    Reverse,
    /// A link to the dialer already exists.
    Duplicate,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SelfConnection => "self",
            RejectReason::Reverse => "reverse",
            RejectReason::Duplicate => "duplicate",
        }
    }

    pub fn to_payload(self) -> Bytes {
        Bytes::from_static(self.as_str().as_bytes())
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        match payload {
            b"self" => Ok(RejectReason::SelfConnection),
            b"reverse" => Ok(RejectReason::Reverse),
            b"duplicate" => Ok(RejectReason::Duplicate),
            other => Err(ProtocolError::Handshake(format!(
                "unknown reject reason {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of REJECT: `<reason>;<acceptor node-id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject {
    pub reason: RejectReason,
    pub node_id: NodeId,
}

impl Reject {
    pub fn to_payload(&self) -> Bytes {
        Bytes::from(format!("{};{}", self.reason, self.node_id))
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = Charset::Latin1.decode(payload)?;
        let Some((reason, id)) = text.split_once(';') else {
            return Err(ProtocolError::Handshake(format!(
                "expected reason;node-id, got {text:?}"
            )));
        };
        Ok(Self {
            reason: RejectReason::parse(reason.as_bytes())?,
            node_id: id.parse()?,
        })
    }
}
