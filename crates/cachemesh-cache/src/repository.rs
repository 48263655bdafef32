//! Cache repository: cache id -> live cache instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::{Cache, CacheError, Result};

/// Read-only lookup used by the invalidation bridge.
pub trait CacheRepository: Send + Sync {
    fn find(&self, cache_id: &str) -> Option<Arc<dyn Cache>>;
}

/// Repository backed by a map, populated by application wiring.
#[derive(Default)]
pub struct InMemoryCacheRepository {
    caches: RwLock<HashMap<String, Arc<dyn Cache>>>,
}

impl InMemoryCacheRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache under its own id.
    pub fn insert(&self, cache: Arc<dyn Cache>) -> Result<()> {
        let id = cache.id().ok_or(CacheError::MissingId)?.to_string();
        let mut caches = self.caches.write().unwrap_or_else(|e| e.into_inner());
        if caches.contains_key(&id) {
            return Err(CacheError::DuplicateId(id));
        }
        caches.insert(id, cache);
        Ok(())
    }

    pub fn remove(&self, cache_id: &str) -> Option<Arc<dyn Cache>> {
        self.caches
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(cache_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .caches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.caches.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheRepository for InMemoryCacheRepository {
    fn find(&self, cache_id: &str) -> Option<Arc<dyn Cache>> {
        self.caches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cache_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyType, MapCache};

    #[test]
    fn test_insert_and_find() {
        let repo = InMemoryCacheRepository::new();
        let cache: Arc<MapCache<String>> = Arc::new(MapCache::new(Some("orders"), KeyType::Long));
        repo.insert(cache).unwrap();

        let found = repo.find("orders").unwrap();
        assert_eq!(found.id(), Some("orders"));
        assert_eq!(found.key_type(), Some(KeyType::Long));
        assert!(repo.find("missing").is_none());
        assert_eq!(repo.ids(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_insert_requires_unique_id() {
        let repo = InMemoryCacheRepository::new();
        let anonymous: Arc<MapCache<String>> = Arc::new(MapCache::new(None, KeyType::String));
        assert!(matches!(repo.insert(anonymous), Err(CacheError::MissingId)));

        let a: Arc<MapCache<String>> = Arc::new(MapCache::new(Some("x"), KeyType::String));
        let b: Arc<MapCache<String>> = Arc::new(MapCache::new(Some("x"), KeyType::String));
        repo.insert(a).unwrap();
        assert!(matches!(repo.insert(b), Err(CacheError::DuplicateId(_))));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_remove() {
        let repo = InMemoryCacheRepository::new();
        let cache: Arc<MapCache<u32>> = Arc::new(MapCache::new(Some("gone"), KeyType::Integer));
        repo.insert(cache).unwrap();
        assert!(repo.remove("gone").is_some());
        assert!(repo.is_empty());
    }
}
