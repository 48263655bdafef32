//! Clear and remove invalidations: payload formats and local application.

use cachemesh_cache::{CacheKey, CacheRepository, KeyType, MutationContext};

use crate::codec::KeyCodecRegistry;
use crate::{validate_cache_id, InvalidationError, Result, SEPARATOR};

/// Result of applying an inbound invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// No local cache with that id.
    UnknownCache,
    /// The local cache lacks the capability the command needs.
    NotSupported,
}

/// CLEAR payload: the cache id, verbatim.
pub fn clear_payload(cache_id: &str) -> Result<String> {
    validate_cache_id(cache_id)?;
    Ok(cache_id.to_string())
}

pub fn apply_clear(
    payload: &str,
    ctx: &MutationContext,
    repository: &dyn CacheRepository,
) -> Result<Outcome> {
    let Some(cache) = repository.find(payload) else {
        return Ok(Outcome::UnknownCache);
    };
    let Some(clearable) = cache.as_clearable() else {
        return Ok(Outcome::NotSupported);
    };
    clearable.clear(ctx)?;
    Ok(Outcome::Applied)
}

/// REMOVE payload: `<cache id>;<key>`. The key is encoded with the codec of
/// the cache's declared key type; a cache that declares none cannot be
/// decoded by the receiver, so it is refused here.
pub fn remove_payload(
    cache_id: &str,
    declared: Option<KeyType>,
    key: &CacheKey,
    codecs: &KeyCodecRegistry,
) -> Result<String> {
    validate_cache_id(cache_id)?;
    let key_type = declared_key_type(cache_id, declared)?;
    let key_text = codecs.get(key_type)?.encode(key)?;
    Ok(format!("{cache_id}{SEPARATOR}{key_text}"))
}

/// The key type both ends agree on for `cache_id`. Never guessed.
pub fn declared_key_type(cache_id: &str, declared: Option<KeyType>) -> Result<KeyType> {
    declared.ok_or_else(|| InvalidationError::UndeclaredKeyType(cache_id.to_string()))
}

/// Split on the first separator: the key may itself contain `;`.
pub fn split_remove(payload: &str) -> Result<(&str, &str)> {
    payload
        .split_once(SEPARATOR)
        .ok_or_else(|| InvalidationError::MissingSeparator(payload.to_string()))
}

/// Decode the key with the local cache's declared type and remove it. An
/// undecodable key, an undeclared type or a type without a codec is an error.
pub fn apply_remove(
    payload: &str,
    ctx: &MutationContext,
    repository: &dyn CacheRepository,
    codecs: &KeyCodecRegistry,
) -> Result<Outcome> {
    let (cache_id, key_text) = split_remove(payload)?;
    let Some(cache) = repository.find(cache_id) else {
        return Ok(Outcome::UnknownCache);
    };
    let Some(removable) = cache.as_removable() else {
        return Ok(Outcome::NotSupported);
    };
    let key_type = declared_key_type(cache_id, cache.key_type())?;
    let key = codecs.decode(key_type, key_text)?;
    removable.remove_key(ctx, &key)?;
    Ok(Outcome::Applied)
}
