//! Invalidation bridge -- binds one cluster channel to the local caches.
//!
//! Outbound: the bridge is a `CacheListener`. A local clear or remove is
//! validated, encoded and broadcast, then recorded in the history.
//! Inbound: the bridge is a `MessageHandler`. CLEAR and REMOVE are applied
//! to the cache of the same id under `MutationContext::Cluster`, so the
//! resulting listener callbacks are suppressed instead of re-broadcast.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cachemesh_cache::{
    Cache, CacheKey, CacheListener, CacheRepository, ListenerError, MutationContext,
};
use cachemesh_channel::{
    ClusterChannel, DispatchContext, HandlerError, HandlerId, MessageHandler,
};
use cachemesh_protocol::{Command, Message, ReceivedMessage};
use serde::Serialize;

use crate::codec::KeyCodecRegistry;
use crate::history::{EventKind, ReportHistory};
use crate::listeners::{self, Outcome};
use crate::{validate_cache_id, InvalidationConfig, InvalidationError, Result, CLEAR, REMOVE};

enum BridgeState {
    Created,
    Running(HandlerId),
    Closed,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    send_failed: AtomicU64,
    skipped: AtomicU64,
    suppressed: AtomicU64,
    applied: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bridge counters exposed for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeStats {
    /// Invalidations handed to the channel.
    pub sent: u64,
    /// Channel refused the send (queue full, not running).
    pub send_failed: u64,
    /// Not sent: unsupported key type, unencodable payload, bridge not running.
    pub skipped: u64,
    /// Local callbacks caused by applying a cluster invalidation.
    pub suppressed: u64,
    pub applied: u64,
    /// Inbound for an unknown cache or one lacking the capability.
    pub ignored: u64,
    /// Inbound that failed to decode or apply.
    pub rejected: u64,
}

pub struct InvalidationBridge {
    channel: Arc<dyn ClusterChannel>,
    repository: Arc<dyn CacheRepository>,
    codecs: KeyCodecRegistry,
    config: InvalidationConfig,
    history: ReportHistory,
    state: Mutex<BridgeState>,
    counters: Counters,
}

impl InvalidationBridge {
    pub fn new(
        channel: Arc<dyn ClusterChannel>,
        repository: Arc<dyn CacheRepository>,
        config: InvalidationConfig,
    ) -> Self {
        Self {
            channel,
            repository,
            codecs: KeyCodecRegistry::standard(),
            history: ReportHistory::new(config.history_capacity, config.capture_stack),
            config,
            state: Mutex::new(BridgeState::Created),
            counters: Counters::default(),
        }
    }

    /// Replace the standard key codecs.
    pub fn with_codecs(mut self, codecs: KeyCodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Subscribe to the channel. Fails on a second call or after `close`.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            BridgeState::Created => {}
            BridgeState::Running(_) => return Err(InvalidationError::AlreadyInitialized),
            BridgeState::Closed => return Err(InvalidationError::Closed),
        }
        let handler: Arc<dyn MessageHandler> = self.clone();
        let id = self.channel.register_message_handler(handler);
        *state = BridgeState::Running(id);
        tracing::info!(handler = %id, transport = %self.channel.transport(), "invalidation bridge started");
        Ok(())
    }

    /// Unsubscribe. Idempotent. Local mutations after this are not sent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let BridgeState::Running(id) = *state {
            self.channel.unregister_message_handler(id);
            tracing::info!(handler = %id, "invalidation bridge closed");
        }
        *state = BridgeState::Closed;
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            BridgeState::Running(_)
        )
    }

    /// This bridge as a cache listener, for `MapCache::add_listener`.
    pub fn listener(self: &Arc<Self>) -> Arc<dyn CacheListener> {
        self.clone()
    }

    pub fn codecs(&self) -> &KeyCodecRegistry {
        &self.codecs
    }

    pub fn history(&self) -> &ReportHistory {
        &self.history
    }

    pub fn config(&self) -> &InvalidationConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<dyn ClusterChannel> {
        &self.channel
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.counters;
        BridgeStats {
            sent: c.sent.load(Ordering::Relaxed),
            send_failed: c.send_failed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Cluster callbacks are the loop guard: they never go back out.
    fn suppressed(&self, ctx: &MutationContext, kind: EventKind, cache: &dyn Cache) -> bool {
        if let MutationContext::Cluster { origin } = ctx {
            bump(&self.counters.suppressed);
            tracing::trace!(
                %kind,
                cache_id = cache.id().unwrap_or_default(),
                origin = %origin.short(),
                "invalidation applied from cluster, not re-broadcast"
            );
            return true;
        }
        false
    }

    fn publish(&self, kind: EventKind, command: Command, cache_id: &str, payload: &str) {
        if !self.is_running() {
            bump(&self.counters.skipped);
            tracing::debug!(%kind, cache_id, "bridge not running, invalidation not sent");
            return;
        }
        let message = match Message::text(command, payload, self.config.charset) {
            Ok(m) => m,
            Err(e) => {
                bump(&self.counters.skipped);
                tracing::warn!(%kind, cache_id, "invalidation skipped: {e}");
                return;
            }
        };
        match self.channel.send(message) {
            Ok(()) => {
                bump(&self.counters.sent);
                tracing::debug!(%kind, cache_id, payload, "invalidation sent");
            }
            Err(e) => {
                bump(&self.counters.send_failed);
                tracing::warn!(
                    %kind,
                    cache_id,
                    queue = self.channel.sending_queue_size(),
                    "invalidation not sent: {e}"
                );
            }
        }
        self.history.record(kind);
    }

    fn apply(&self, command: Command, ctx: &MutationContext, message: &ReceivedMessage) -> Result<Outcome> {
        let payload = message.payload_text()?;
        if command == CLEAR {
            listeners::apply_clear(&payload, ctx, self.repository.as_ref())
        } else {
            listeners::apply_remove(&payload, ctx, self.repository.as_ref(), &self.codecs)
        }
    }
}

impl CacheListener for InvalidationBridge {
    fn after_clear(
        &self,
        ctx: &MutationContext,
        cache: &dyn Cache,
    ) -> std::result::Result<(), ListenerError> {
        if self.suppressed(ctx, EventKind::Clear, cache) {
            return Ok(());
        }
        let Some(cache_id) = cache.id() else {
            return Ok(());
        };
        let payload = listeners::clear_payload(cache_id)?;
        self.publish(EventKind::Clear, CLEAR, cache_id, &payload);
        Ok(())
    }

    fn after_remove(
        &self,
        ctx: &MutationContext,
        cache: &dyn Cache,
        key: &CacheKey,
        _old_value: Option<&dyn fmt::Debug>,
    ) -> std::result::Result<(), ListenerError> {
        if self.suppressed(ctx, EventKind::Remove, cache) {
            return Ok(());
        }
        let Some(cache_id) = cache.id() else {
            return Ok(());
        };
        validate_cache_id(cache_id)?;
        let payload =
            match listeners::remove_payload(cache_id, cache.key_type(), key, &self.codecs) {
                Ok(payload) => payload,
                Err(
                    e @ (InvalidationError::UnsupportedKeyType(_)
                    | InvalidationError::UndeclaredKeyType(_)
                    | InvalidationError::KeyTypeMismatch { .. }),
                ) => {
                    bump(&self.counters.skipped);
                    tracing::warn!(cache_id, %key, "remove not propagated: {e}");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
        self.publish(EventKind::Remove, REMOVE, cache_id, &payload);
        Ok(())
    }
}

impl MessageHandler for InvalidationBridge {
    fn on_message(
        &self,
        ctx: &DispatchContext,
        message: &ReceivedMessage,
    ) -> std::result::Result<(), HandlerError> {
        let command = message.command();
        if command != CLEAR && command != REMOVE {
            return Ok(());
        }
        let mutation = MutationContext::Cluster { origin: ctx.origin };

        match self.apply(command, &mutation, message) {
            Ok(Outcome::Applied) => {
                bump(&self.counters.applied);
                tracing::debug!(%command, origin = %ctx.origin.short(), "invalidation applied");
                Ok(())
            }
            Ok(outcome) => {
                bump(&self.counters.ignored);
                tracing::debug!(%command, ?outcome, origin = %ctx.origin.short(), "invalidation ignored");
                Ok(())
            }
            Err(e) => {
                bump(&self.counters.rejected);
                Err(e.into())
            }
        }
    }
}

impl fmt::Debug for InvalidationBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBridge")
            .field("transport", &self.channel.transport())
            .field("running", &self.is_running())
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}
