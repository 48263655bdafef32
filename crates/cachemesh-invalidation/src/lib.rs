//! Cachemesh Invalidation -- makes local cache mutations cluster-wide.
//!
//! The bridge listens to local caches and broadcasts two commands:
//!   - CLEAR  payload `<cache id>`
//!   - REMOVE payload `<cache id>;<key>`
//!
//! Inbound commands are applied to the local cache of the same id under a
//! `MutationContext::Cluster`, which the outbound hooks recognise and never
//! re-broadcast. Only invalidations travel the wire, never cached values.

pub mod bridge;
pub mod codec;
pub mod history;
pub mod listeners;

pub use bridge::{BridgeStats, InvalidationBridge};
pub use codec::{KeyCodec, KeyCodecRegistry};
pub use history::{EventKind, ReportHistory, ReportKey, ReportSnapshot};

use cachemesh_cache::{CacheError, KeyType};
use cachemesh_channel::ChannelError;
use cachemesh_protocol::{Charset, Command, ProtocolError};
use serde::{Deserialize, Serialize};

/// Whole-cache invalidation.
pub const CLEAR: Command = Command::from_code(0x01);
/// Single-key invalidation.
pub const REMOVE: Command = Command::from_code(0x02);

/// Separates cache id and key in a REMOVE payload.
pub const SEPARATOR: char = ';';

#[derive(Debug, thiserror::Error)]
pub enum InvalidationError {
    #[error("invalid cache id {id:?}: {reason}")]
    InvalidCacheId { id: String, reason: &'static str },
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(KeyType),
    #[error("cache {0:?} declares no key type")]
    UndeclaredKeyType(String),
    #[error("cannot decode {value:?} as {key_type} key")]
    InvalidKey { key_type: KeyType, value: String },
    #[error("key {key} does not match codec type {expected}")]
    KeyTypeMismatch { expected: KeyType, key: String },
    #[error("remove payload has no separator: {0:?}")]
    MissingSeparator(String),
    #[error("bridge already initialized")]
    AlreadyInitialized,
    #[error("bridge is closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, InvalidationError>;

/// Reject ids that are empty or contain the wire separator. Never truncates.
pub fn validate_cache_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(InvalidationError::InvalidCacheId {
            id: id.to_string(),
            reason: "must not be empty",
        });
    }
    if id.contains(SEPARATOR) {
        return Err(InvalidationError::InvalidCacheId {
            id: id.to_string(),
            reason: "must not contain ';'",
        });
    }
    Ok(())
}

/// Bridge configuration (the `[invalidation]` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Distinct reports kept in the diagnostic history. 0 disables it.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Key reports by call stack as well as kind. Costly; off by default.
    #[serde(default)]
    pub capture_stack: bool,
    /// Text encoding for payloads. Must match on every node.
    #[serde(default)]
    pub charset: Charset,
}

fn default_history_capacity() -> usize {
    64
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            capture_stack: false,
            charset: Charset::default(),
        }
    }
}
