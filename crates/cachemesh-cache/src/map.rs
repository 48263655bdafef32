//! In-process cache backed by a `HashMap`, with listener hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use crate::{
    Cache, CacheError, CacheKey, CacheListener, Clearable, KeyType, MutationContext,
    RemovableByKey, Result,
};

/// A keyed cache that reports clears and removals to its listeners.
///
/// Listeners are held weakly: a listener that usually owns the repository
/// this cache lives in (the invalidation bridge) must not keep it alive.
pub struct MapCache<V> {
    id: Option<String>,
    key_type: KeyType,
    entries: RwLock<HashMap<CacheKey, V>>,
    listeners: RwLock<Vec<Weak<dyn CacheListener>>>,
}

impl<V> MapCache<V>
where
    V: Clone + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(id: Option<&str>, key_type: KeyType) -> Self {
        Self {
            id: id.map(str::to_string),
            key_type,
            entries: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: &Arc<dyn CacheListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.live_listeners().len()
    }

    pub fn put(&self, key: CacheKey, value: V) -> Result<Option<V>> {
        self.check_key(&key)?;
        Ok(self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value))
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Remove one entry and fire `after_remove`, present or not.
    pub fn remove(&self, ctx: &MutationContext, key: &CacheKey) -> Result<Option<V>> {
        self.check_key(key)?;
        let old = self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);

        let old_debug = old.as_ref().map(|v| v as &dyn fmt::Debug);
        self.notify(|l| l.after_remove(ctx, self, key, old_debug))?;
        Ok(old)
    }

    /// Drop every entry and fire `after_clear`.
    pub fn clear(&self, ctx: &MutationContext) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.notify(|l| l.after_clear(ctx, self))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn check_key(&self, key: &CacheKey) -> Result<()> {
        if key.key_type() != self.key_type {
            return Err(CacheError::KeyTypeMismatch {
                expected: self.key_type,
                actual: key.key_type(),
            });
        }
        Ok(())
    }

    fn live_listeners(&self) -> Vec<Arc<dyn CacheListener>> {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|w| w.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    /// Call every listener (outside the entry lock); the first failure wins.
    fn notify<F>(&self, mut call: F) -> Result<()>
    where
        F: FnMut(&dyn CacheListener) -> std::result::Result<(), crate::ListenerError>,
    {
        let mut first_err = None;
        for listener in self.live_listeners() {
            if let Err(e) = call(listener.as_ref()) {
                tracing::debug!(cache = ?self.id, "cache listener failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(CacheError::Listener(e)),
            None => Ok(()),
        }
    }
}

impl<V> Cache for MapCache<V>
where
    V: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn key_type(&self) -> Option<KeyType> {
        Some(self.key_type)
    }

    fn as_clearable(&self) -> Option<&dyn Clearable> {
        Some(self)
    }

    fn as_removable(&self) -> Option<&dyn RemovableByKey> {
        Some(self)
    }
}

impl<V> Clearable for MapCache<V>
where
    V: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn clear(&self, ctx: &MutationContext) -> Result<()> {
        MapCache::<V>::clear(self, ctx)
    }
}

impl<V> RemovableByKey for MapCache<V>
where
    V: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn remove_key(&self, ctx: &MutationContext, key: &CacheKey) -> Result<bool> {
        Ok(self.remove(ctx, key)?.is_some())
    }
}

impl<V> fmt::Debug for MapCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapCache")
            .field("id", &self.id)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachemesh_protocol::NodeId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        fail: bool,
    }

    impl CacheListener for Recorder {
        fn after_clear(
            &self,
            ctx: &MutationContext,
            cache: &dyn Cache,
        ) -> std::result::Result<(), crate::ListenerError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("clear {} {}", cache.id().unwrap_or("-"), ctx));
            if self.fail {
                return Err("listener refused".into());
            }
            Ok(())
        }

        fn after_remove(
            &self,
            ctx: &MutationContext,
            cache: &dyn Cache,
            key: &CacheKey,
            old_value: Option<&dyn fmt::Debug>,
        ) -> std::result::Result<(), crate::ListenerError> {
            self.events.lock().unwrap().push(format!(
                "remove {} {} {:?} {}",
                cache.id().unwrap_or("-"),
                key,
                old_value.map(|v| format!("{v:?}")),
                ctx
            ));
            Ok(())
        }
    }

    fn orders() -> MapCache<String> {
        MapCache::new(Some("orders"), KeyType::Long)
    }

    #[test]
    fn test_put_get() {
        let cache = orders();
        assert!(cache.put(42i64.into(), "pending".into()).unwrap().is_none());
        assert_eq!(cache.get(&42i64.into()).as_deref(), Some("pending"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_key_type_enforced() {
        let cache = orders();
        let err = cache.put("42".into(), "x".into()).unwrap_err();
        assert!(matches!(
            err,
            CacheError::KeyTypeMismatch {
                expected: KeyType::Long,
                actual: KeyType::String
            }
        ));
    }

    #[test]
    fn test_remove_notifies_with_old_value() {
        let cache = orders();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn CacheListener> = recorder.clone();
        cache.add_listener(&listener);

        cache.put(42i64.into(), "pending".into()).unwrap();
        let old = cache.remove(&MutationContext::Local, &42i64.into()).unwrap();
        assert_eq!(old.as_deref(), Some("pending"));

        // Absent key: still a successful mutation
        assert!(cache.remove(&MutationContext::Local, &7i64.into()).unwrap().is_none());

        let events = recorder.events.lock().unwrap();
        assert_eq!(events[0], "remove orders 42 Some(\"\\\"pending\\\"\") local");
        assert_eq!(events[1], "remove orders 7 None local");
    }

    #[test]
    fn test_clear_passes_context() {
        let cache = orders();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn CacheListener> = recorder.clone();
        cache.add_listener(&listener);

        cache.put(1i64.into(), "a".into()).unwrap();
        let origin = NodeId::random();
        cache.clear(&MutationContext::Cluster { origin }).unwrap();
        assert!(cache.is_empty());

        let events = recorder.events.lock().unwrap();
        assert_eq!(events[0], format!("clear orders cluster({})", origin.short()));
    }

    #[test]
    fn test_listener_error_after_mutation() {
        let cache = orders();
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let listener: Arc<dyn CacheListener> = recorder.clone();
        cache.add_listener(&listener);

        cache.put(1i64.into(), "a".into()).unwrap();
        let err = cache.clear(&MutationContext::Local).unwrap_err();
        assert!(matches!(err, CacheError::Listener(_)));
        // The local mutation stands
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let cache = orders();
        {
            let listener: Arc<dyn CacheListener> = Arc::new(Recorder::default());
            cache.add_listener(&listener);
            assert_eq!(cache.listener_count(), 1);
        }
        assert_eq!(cache.listener_count(), 0);
        cache.clear(&MutationContext::Local).unwrap();
    }

    #[test]
    fn test_capabilities() {
        let cache = orders();
        cache.put(5i64.into(), "x".into()).unwrap();
        let dyn_cache: &dyn Cache = &cache;
        let removable = dyn_cache.as_removable().unwrap();
        assert!(removable
            .remove_key(&MutationContext::Local, &5i64.into())
            .unwrap());
        assert!(dyn_cache.as_clearable().is_some());
    }
}
