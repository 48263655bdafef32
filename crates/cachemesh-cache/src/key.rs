//! Cache key types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared key type of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Integer,
    Long,
    Boolean,
    String,
    Bytes,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Integer => "integer",
            KeyType::Long => "long",
            KeyType::Boolean => "boolean",
            KeyType::String => "string",
            KeyType::Bytes => "bytes",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CacheKey {
    Integer(i32),
    Long(i64),
    Boolean(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl CacheKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            CacheKey::Integer(_) => KeyType::Integer,
            CacheKey::Long(_) => KeyType::Long,
            CacheKey::Boolean(_) => KeyType::Boolean,
            CacheKey::String(_) => KeyType::String,
            CacheKey::Bytes(_) => KeyType::Bytes,
        }
    }
}

/// String form of the key. Bytes render as lowercase hex.
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Integer(v) => write!(f, "{v}"),
            CacheKey::Long(v) => write!(f, "{v}"),
            CacheKey::Boolean(v) => write!(f, "{v}"),
            CacheKey::String(v) => f.write_str(v),
            CacheKey::Bytes(v) => f.write_str(&hex::encode(v)),
        }
    }
}

impl From<i32> for CacheKey {
    fn from(v: i32) -> Self {
        CacheKey::Integer(v)
    }
}

impl From<i64> for CacheKey {
    fn from(v: i64) -> Self {
        CacheKey::Long(v)
    }
}

impl From<bool> for CacheKey {
    fn from(v: bool) -> Self {
        CacheKey::Boolean(v)
    }
}

impl From<&str> for CacheKey {
    fn from(v: &str) -> Self {
        CacheKey::String(v.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(v: String) -> Self {
        CacheKey::String(v)
    }
}
