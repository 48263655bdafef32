//! Key codecs -- typed cache keys to and from their wire string form.
//!
//! One codec per `KeyType`, looked up by tag in a `KeyCodecRegistry`. A
//! type with no registered codec is an explicit `UnsupportedKeyType`.

use std::collections::HashMap;

use cachemesh_cache::{CacheKey, KeyType};

use crate::{InvalidationError, Result};

pub trait KeyCodec: Send + Sync {
    fn key_type(&self) -> KeyType;
    fn encode(&self, key: &CacheKey) -> Result<String>;
    fn decode(&self, text: &str) -> Result<CacheKey>;
}

fn mismatch(expected: KeyType, key: &CacheKey) -> InvalidationError {
    InvalidationError::KeyTypeMismatch {
        expected,
        key: format!("{key:?}"),
    }
}

fn invalid(key_type: KeyType, text: &str) -> InvalidationError {
    InvalidationError::InvalidKey {
        key_type,
        value: text.to_string(),
    }
}

struct IntegerCodec;

impl KeyCodec for IntegerCodec {
    fn key_type(&self) -> KeyType {
        KeyType::Integer
    }

    fn encode(&self, key: &CacheKey) -> Result<String> {
        match key {
            CacheKey::Integer(v) => Ok(v.to_string()),
            other => Err(mismatch(KeyType::Integer, other)),
        }
    }

    fn decode(&self, text: &str) -> Result<CacheKey> {
        text.parse()
            .map(CacheKey::Integer)
            .map_err(|_| invalid(KeyType::Integer, text))
    }
}

struct LongCodec;

impl KeyCodec for LongCodec {
    fn key_type(&self) -> KeyType {
        KeyType::Long
    }

    fn encode(&self, key: &CacheKey) -> Result<String> {
        match key {
            CacheKey::Long(v) => Ok(v.to_string()),
            other => Err(mismatch(KeyType::Long, other)),
        }
    }

    fn decode(&self, text: &str) -> Result<CacheKey> {
        text.parse()
            .map(CacheKey::Long)
            .map_err(|_| invalid(KeyType::Long, text))
    }
}

/// Accepts `true`/`false` in any case, nothing else.
struct BooleanCodec;

impl KeyCodec for BooleanCodec {
    fn key_type(&self) -> KeyType {
        KeyType::Boolean
    }

    fn encode(&self, key: &CacheKey) -> Result<String> {
        match key {
            CacheKey::Boolean(v) => Ok(v.to_string()),
            other => Err(mismatch(KeyType::Boolean, other)),
        }
    }

    fn decode(&self, text: &str) -> Result<CacheKey> {
        if text.eq_ignore_ascii_case("true") {
            Ok(CacheKey::Boolean(true))
        } else if text.eq_ignore_ascii_case("false") {
            Ok(CacheKey::Boolean(false))
        } else {
            Err(invalid(KeyType::Boolean, text))
        }
    }
}

struct StringCodec;

impl KeyCodec for StringCodec {
    fn key_type(&self) -> KeyType {
        KeyType::String
    }

    fn encode(&self, key: &CacheKey) -> Result<String> {
        match key {
            CacheKey::String(v) => Ok(v.clone()),
            other => Err(mismatch(KeyType::String, other)),
        }
    }

    fn decode(&self, text: &str) -> Result<CacheKey> {
        Ok(CacheKey::String(text.to_string()))
    }
}

pub struct KeyCodecRegistry {
    codecs: HashMap<KeyType, Box<dyn KeyCodec>>,
}

impl KeyCodecRegistry {
    /// Empty registry: every key type is unsupported.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Integer, Long, Boolean and String.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(IntegerCodec));
        registry.register(Box::new(LongCodec));
        registry.register(Box::new(BooleanCodec));
        registry.register(Box::new(StringCodec));
        registry
    }

    /// Add or replace the codec for its key type.
    pub fn register(&mut self, codec: Box<dyn KeyCodec>) {
        self.codecs.insert(codec.key_type(), codec);
    }

    pub fn supports(&self, key_type: KeyType) -> bool {
        self.codecs.contains_key(&key_type)
    }

    pub fn get(&self, key_type: KeyType) -> Result<&dyn KeyCodec> {
        self.codecs
            .get(&key_type)
            .map(|c| c.as_ref())
            .ok_or(InvalidationError::UnsupportedKeyType(key_type))
    }

    pub fn encode(&self, key: &CacheKey) -> Result<String> {
        self.get(key.key_type())?.encode(key)
    }

    pub fn decode(&self, key_type: KeyType, text: &str) -> Result<CacheKey> {
        self.get(key_type)?.decode(text)
    }

    /// Registered key types, sorted by name.
    pub fn key_types(&self) -> Vec<KeyType> {
        let mut types: Vec<KeyType> = self.codecs.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

impl Default for KeyCodecRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for KeyCodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCodecRegistry")
            .field("key_types", &self.key_types())
            .finish()
    }
}
