//! Cachemesh Cache -- local caches and the hooks that make them cluster-wide.
//!
//! A cache advertises what it can do through capability accessors
//! (`as_clearable`, `as_removable`) and reports successful mutations to its
//! `CacheListener`s. Every mutation carries a `MutationContext` so listeners
//! can tell a local change from one applied on behalf of a peer.

pub mod key;
pub mod map;
pub mod repository;

pub use key::{CacheKey, KeyType};
pub use map::MapCache;
pub use repository::{CacheRepository, InMemoryCacheRepository};

use cachemesh_protocol::NodeId;
use std::fmt;

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("key type mismatch: cache declares {expected}, got {actual}")]
    KeyTypeMismatch { expected: KeyType, actual: KeyType },
    #[error("cache has no id and cannot be registered")]
    MissingId,
    #[error("cache {0:?} is already registered")]
    DuplicateId(String),
    #[error("cache listener failed: {0}")]
    Listener(ListenerError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Who asked for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationContext {
    /// Application code on this node.
    Local,
    /// Applied while handling an invalidation from `origin`.
    Cluster { origin: NodeId },
}

impl MutationContext {
    pub fn is_cluster(&self) -> bool {
        matches!(self, MutationContext::Cluster { .. })
    }

    pub fn origin(&self) -> Option<NodeId> {
        match self {
            MutationContext::Local => None,
            MutationContext::Cluster { origin } => Some(*origin),
        }
    }
}

impl fmt::Display for MutationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationContext::Local => f.write_str("local"),
            MutationContext::Cluster { origin } => write!(f, "cluster({})", origin.short()),
        }
    }
}

/// A cache as seen by cluster plumbing.
pub trait Cache: Send + Sync {
    /// Cluster-wide identifier. Caches without one stay local.
    fn id(&self) -> Option<&str>;

    /// Declared key type, if the cache has one.
    fn key_type(&self) -> Option<KeyType>;

    fn as_clearable(&self) -> Option<&dyn Clearable> {
        None
    }

    fn as_removable(&self) -> Option<&dyn RemovableByKey> {
        None
    }
}

pub trait Clearable: Send + Sync {
    fn clear(&self, ctx: &MutationContext) -> Result<()>;
}

pub trait RemovableByKey: Send + Sync {
    /// Remove `key`. Returns whether an entry was present; removing an
    /// absent key is not an error.
    fn remove_key(&self, ctx: &MutationContext, key: &CacheKey) -> Result<bool>;
}

/// Post-mutation hooks, called after the local change has been applied.
pub trait CacheListener: Send + Sync {
    fn after_clear(
        &self,
        ctx: &MutationContext,
        cache: &dyn Cache,
    ) -> std::result::Result<(), ListenerError>;

    fn after_remove(
        &self,
        ctx: &MutationContext,
        cache: &dyn Cache,
        key: &CacheKey,
        old_value: Option<&dyn fmt::Debug>,
    ) -> std::result::Result<(), ListenerError>;
}
