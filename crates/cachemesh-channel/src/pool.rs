//! Peer pool -- thread-safe registry of live TCP links.
//!
//! Maps NodeId → PeerLink. At most one link per peer: whichever side wins
//! the handshake inserts it, a second insert for the same node is refused.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use cachemesh_protocol::{Frame, Node, NodeId};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkDirection {
    Inbound,
    Outbound,
}

impl LinkDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkDirection::Inbound => "inbound",
            LinkDirection::Outbound => "outbound",
        }
    }
}

/// One established link. The writer task owns the receiving end of `tx`.
#[derive(Debug)]
pub struct PeerLink {
    /// Peer identity and the address it listens on.
    pub node: Node,
    /// Socket peer address (ephemeral port for inbound links).
    pub remote_addr: SocketAddr,
    pub direction: LinkDirection,
    pub link_id: u64,
    pub connected_at: Instant,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    tx: mpsc::UnboundedSender<Frame>,
    pending: AtomicUsize,
    token: CancellationToken,
}

impl PeerLink {
    pub fn new(
        node: Node,
        remote_addr: SocketAddr,
        direction: LinkDirection,
        link_id: u64,
        tx: mpsc::UnboundedSender<Frame>,
        token: CancellationToken,
    ) -> Self {
        Self {
            node,
            remote_addr,
            direction,
            link_id,
            connected_at: Instant::now(),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            tx,
            pending: AtomicUsize::new(0),
            token,
        }
    }

    /// Queue a frame for the writer. False once the writer has gone.
    pub fn enqueue(&self, frame: Frame) -> bool {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(frame).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Writer finished one frame (written or abandoned).
    pub fn frame_done(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            node_id: self.node.id.to_string(),
            addr: self.node.addr.to_string(),
            direction: Some(self.direction.as_str().to_string()),
            connected_secs: Some(self.connected_at.elapsed().as_secs()),
            last_seen_ms: None,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }
}

/// Per-peer view for diagnostics, transport-neutral.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub node_id: String,
    pub addr: String,
    pub direction: Option<String>,
    pub connected_secs: Option<u64>,
    pub last_seen_ms: Option<u64>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub pending: usize,
}

impl PeerSummary {
    pub fn from_node(node: &Node) -> Self {
        Self {
            node_id: node.id.to_string(),
            addr: node.addr.to_string(),
            direction: None,
            connected_secs: None,
            last_seen_ms: None,
            messages_sent: 0,
            messages_received: 0,
            pending: 0,
        }
    }
}

/// Thread-safe pool of live links.
#[derive(Clone, Default)]
pub struct PeerPool {
    inner: Arc<RwLock<HashMap<NodeId, Arc<PeerLink>>>>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a link to the same node exists. Returns false (and
    /// leaves the pool untouched) on a duplicate.
    pub fn insert(&self, link: Arc<PeerLink>) -> bool {
        let node = link.node.clone();
        let direction = link.direction;
        let pool_size = {
            let mut pool = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if pool.contains_key(&node.id) {
                return false;
            }
            pool.insert(node.id, link);
            pool.len()
        };
        tracing::debug!(
            peer = %node,
            direction = direction.as_str(),
            pool_size,
            "pool: link added"
        );
        true
    }

    /// Remove the link only if it is still the one identified by `link_id`,
    /// so a stale teardown never evicts a newer link.
    pub fn remove(&self, node_id: &NodeId, link_id: u64) -> Option<Arc<PeerLink>> {
        let mut pool = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match pool.get(node_id) {
            Some(link) if link.link_id == link_id => {}
            _ => return None,
        }
        let removed = pool.remove(node_id);
        tracing::debug!(
            peer = %node_id.short(),
            pool_size = pool.len(),
            "pool: link removed"
        );
        removed
    }

    /// Empty the pool, returning every link.
    pub fn drain(&self) -> Vec<Arc<PeerLink>> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, link)| link)
            .collect()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<PeerLink>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .cloned()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(node_id)
    }

    pub fn links(&self) -> Vec<Arc<PeerLink>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|l| l.node.clone())
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Frames handed to link writers but not yet written.
    pub fn pending_total(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|l| l.pending())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self.links().iter().map(|l| l.summary()).collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }
}
