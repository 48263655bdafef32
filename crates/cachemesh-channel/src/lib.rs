//! Cachemesh Channel -- cluster membership plus a broadcast message bus.
//!
//! Two transports implement `ClusterChannel`:
//!   - `TcpChannel`: static full mesh, one framed link per peer pair.
//!   - `MulticastChannel`: one UDP multicast group, heartbeat membership.
//!
//! Handlers run synchronously on the transport's receive path. Once
//! `close()` returns, no handler is invoked again for that channel.

mod shared;
pub mod multicast;
pub mod pool;
pub mod tcp;

pub use multicast::{MulticastChannel, MulticastConfig};
pub use pool::{LinkDirection, PeerPool, PeerSummary};
pub use tcp::{TcpChannel, TcpConfig};

use cachemesh_protocol::{Message, Node, NodeId, ProtocolError, ReceivedMessage};
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel already initialized")]
    AlreadyInitialized,
    #[error("channel is not running")]
    NotRunning,
    #[error("channel is closed")]
    Closed,
    #[error("send queue full ({capacity} messages)")]
    QueueFull { capacity: usize },
    #[error("send queue still full after {0:?}")]
    SendTimeout(Duration),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Registration handle returned by `register_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Multicast,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Multicast => "multicast",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Passed to every handler invocation: the call is processing an inbound
/// cluster message from `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContext {
    pub local: NodeId,
    pub origin: NodeId,
    pub transport: TransportKind,
}

pub trait MessageHandler: Send + Sync {
    fn on_message(
        &self,
        ctx: &DispatchContext,
        message: &ReceivedMessage,
    ) -> std::result::Result<(), HandlerError>;
}

pub trait PresenceHandler: Send + Sync {
    fn node_entered(&self, node: &Node);
    fn node_left(&self, node: &Node);
}

/// Forced liveness probe, for callers that want faster convergence than
/// the heartbeat schedule gives.
pub trait Pingable: Send + Sync {
    fn ping(&self);
}

/// Membership view plus broadcast to every known peer (never to self).
pub trait ClusterChannel: Send + Sync {
    /// Bind sockets and start the background tasks. A second call fails
    /// with `AlreadyInitialized`.
    fn init(&self) -> BoxFuture<'_, Result<()>>;

    fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerId;
    fn unregister_message_handler(&self, id: HandlerId) -> bool;
    fn register_presence_handler(&self, handler: Arc<dyn PresenceHandler>) -> HandlerId;
    fn unregister_presence_handler(&self, id: HandlerId) -> bool;

    /// Enqueue for every currently known peer. Never waits: a full queue
    /// is `QueueFull`.
    fn send(&self, message: Message) -> Result<()>;

    /// Like `send`, but waits up to `timeout` for queue space.
    fn send_timeout(&self, message: Message, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    /// Snapshot of currently known peers.
    fn nodes(&self) -> Vec<Node>;

    /// Per-peer diagnostics. Transports with richer state override this.
    fn peer_details(&self) -> Vec<PeerSummary> {
        self.nodes().iter().map(PeerSummary::from_node).collect()
    }

    /// Messages not yet written to the wire.
    fn sending_queue_size(&self) -> usize;

    /// This node, once `init` has bound the transport.
    fn local_node(&self) -> Option<Node>;

    /// Stop every task and release sockets. Idempotent, callable from any
    /// thread. Must not be called from inside a handler.
    fn close(&self);

    fn as_pingable(&self) -> Option<&dyn Pingable> {
        None
    }

    fn transport(&self) -> TransportKind;

    fn stats(&self) -> ChannelStats;
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    pub messages_queued: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub send_rejected: u64,
    pub handler_failures: u64,
    pub peers_joined: u64,
    pub peers_left: u64,
    pub dial_failures: u64,
    pub queue_size: usize,
}

/// Poll `condition` every `poll_interval` until it holds or `timeout`
/// passes. Returns the last evaluation.
pub async fn wait_for<F>(mut condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return condition();
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_for_succeeds_when_condition_turns_true() {
        let calls = AtomicUsize::new(0);
        let ok = wait_for(
            || calls.fetch_add(1, Ordering::SeqCst) >= 3,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let start = std::time::Instant::now();
        let ok = wait_for(|| false, Duration::from_millis(50), Duration::from_millis(10)).await;
        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_transport_names() {
        assert_eq!(TransportKind::Tcp.to_string(), "tcp");
        assert_eq!(TransportKind::Multicast.as_str(), "multicast");
        assert_eq!(HandlerId(7).to_string(), "handler-7");
    }
}
