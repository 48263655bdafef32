//! Cachemesh Membership -- peer liveness and dial scheduling.
//!
//! Pure bookkeeping, no I/O. Transports feed observations in and act on what
//! comes back:
//!   - `Liveness`: last-heard tracking with silence-timeout reaping (multicast).
//!   - `DialSchedule`: which member addresses to dial next, with exponential
//!     reconnect backoff (TCP mesh).

use cachemesh_protocol::{Node, NodeId, RejectReason, DEFAULT_TIMING};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

// ============================================================================
// Liveness
// ============================================================================

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node: Node,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub observations: u64,
}

/// What an observation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First time this node id is heard from.
    Joined,
    /// Known node, same address.
    Refreshed,
    /// Known node now speaking from a different address.
    Moved { previous: SocketAddr },
}

/// Silence-timeout membership: a peer exists while it keeps talking.
#[derive(Debug)]
pub struct Liveness {
    peers: HashMap<NodeId, PeerInfo>,
    silence_timeout: Duration,
}

impl Liveness {
    pub fn new(silence_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            silence_timeout,
        }
    }

    /// Record that `node` was heard from at `now` (probe or data message).
    pub fn observe(&mut self, node: Node, now: Instant) -> Observation {
        match self.peers.get_mut(&node.id) {
            Some(peer) => {
                peer.last_seen = now;
                peer.observations += 1;
                if peer.node.addr != node.addr {
                    let previous = peer.node.addr;
                    peer.node = node;
                    Observation::Moved { previous }
                } else {
                    Observation::Refreshed
                }
            }
            None => {
                self.peers.insert(
                    node.id,
                    PeerInfo {
                        node,
                        first_seen: now,
                        last_seen: now,
                        observations: 1,
                    },
                );
                Observation::Joined
            }
        }
    }

    /// Drop a peer immediately (explicit leave).
    pub fn forget(&mut self, node_id: &NodeId) -> Option<PeerInfo> {
        self.peers.remove(node_id)
    }

    /// Remove and return every peer silent for longer than the timeout.
    pub fn reap(&mut self, now: Instant) -> Vec<Node> {
        let timeout = self.silence_timeout;
        let silent: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|p| p.node.id)
            .collect();

        silent
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .map(|p| p.node)
            .collect()
    }

    pub fn peer_info(&self, node_id: &NodeId) -> Option<&PeerInfo> {
        self.peers.get(node_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    /// Known nodes, sorted by id.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.peers.values().map(|p| p.node.clone()).collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn silence_timeout(&self) -> Duration {
        self.silence_timeout
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ============================================================================
// Reconnect backoff
// ============================================================================

/// Exponential backoff: min(base * 2^failures, max), plus random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub saturation_count: u32,
    pub jitter_per_mille: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_TIMING.tcp_reconnect_base_ms),
            max: Duration::from_millis(DEFAULT_TIMING.tcp_reconnect_max_ms),
            saturation_count: DEFAULT_TIMING.backoff_saturation_count,
            jitter_per_mille: DEFAULT_TIMING.reconnect_jitter_per_mille,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the delay. Zero when nothing has failed yet.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(self.saturation_count);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.max)
    }

    /// Delay with up to `jitter_per_mille` / 1000 extra, so a restarted
    /// cluster does not redial in lockstep.
    pub fn delay_with_jitter(&self, failures: u32) -> Duration {
        let delay = self.delay(failures);
        if delay.is_zero() || self.jitter_per_mille == 0 {
            return delay;
        }
        let spread = delay.as_millis() as u64 * self.jitter_per_mille as u64 / 1000;
        let extra = rand::thread_rng().gen_range(0..=spread);
        delay + Duration::from_millis(extra)
    }
}

// ============================================================================
// Dial schedule
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    /// Not linked; dial once `next_attempt` passes.
    Idle,
    /// A dial is in flight.
    Dialing,
    /// A link to the owning node is up (initiated by either side).
    Linked(NodeId),
    /// The address is our own listener. Never dialed again.
    Excluded,
}

impl DialState {
    pub fn name(&self) -> &'static str {
        match self {
            DialState::Idle => "idle",
            DialState::Dialing => "dialing",
            DialState::Linked(_) => "linked",
            DialState::Excluded => "excluded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialTarget {
    pub addr: SocketAddr,
    /// Node id last seen behind this address.
    pub owner: Option<NodeId>,
    pub state: DialState,
    pub failures: u32,
    pub next_attempt: Instant,
    /// Learned from a peer's handshake rather than configured.
    pub learned: bool,
}

impl DialTarget {
    fn new(addr: SocketAddr, now: Instant, learned: bool) -> Self {
        Self {
            addr,
            owner: None,
            state: DialState::Idle,
            failures: 0,
            next_attempt: now,
            learned,
        }
    }
}

/// Dial bookkeeping for a statically configured full mesh.
#[derive(Debug)]
pub struct DialSchedule {
    targets: HashMap<SocketAddr, DialTarget>,
    backoff: BackoffPolicy,
}

impl DialSchedule {
    pub fn new(members: impl IntoIterator<Item = SocketAddr>, backoff: BackoffPolicy) -> Self {
        let now = Instant::now();
        let targets = members
            .into_iter()
            .map(|addr| (addr, DialTarget::new(addr, now, false)))
            .collect();
        Self { targets, backoff }
    }

    /// Addresses due for a dial. Each returned target moves to `Dialing`.
    pub fn tick(&mut self, now: Instant) -> Vec<SocketAddr> {
        let mut due: Vec<SocketAddr> = self
            .targets
            .values_mut()
            .filter(|t| t.state == DialState::Idle && t.next_attempt <= now)
            .map(|t| {
                t.state = DialState::Dialing;
                t.addr
            })
            .collect();
        due.sort();
        due
    }

    /// Make every idle target due immediately (forced liveness probe).
    pub fn expedite(&mut self, now: Instant) {
        for target in self.targets.values_mut() {
            if target.state == DialState::Idle {
                target.next_attempt = now;
            }
        }
    }

    /// Outbound handshake completed: the link to `owner` goes through `addr`.
    pub fn dial_succeeded(&mut self, addr: SocketAddr, owner: NodeId) {
        if let Some(target) = self.targets.get_mut(&addr) {
            target.owner = Some(owner);
            target.state = DialState::Linked(owner);
            target.failures = 0;
        }
    }

    /// Connect, handshake or I/O failure while dialing `addr`.
    pub fn dial_failed(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(target) = self.targets.get_mut(&addr) {
            if target.state == DialState::Dialing {
                target.state = DialState::Idle;
            }
            self.penalise(addr, now);
        }
    }

    /// The acceptor refused the link.
    ///
    /// `SelfConnection` excludes the address for good. `Reverse` and
    /// `Duplicate` mean the link exists or is about to be dialed from the
    /// other side, so only retry on the backoff schedule as a safety net.
    pub fn dial_rejected(
        &mut self,
        addr: SocketAddr,
        owner: NodeId,
        reason: RejectReason,
        now: Instant,
    ) {
        let Some(target) = self.targets.get_mut(&addr) else {
            return;
        };
        target.owner = Some(owner);
        match reason {
            RejectReason::SelfConnection => {
                target.state = DialState::Excluded;
            }
            RejectReason::Reverse | RejectReason::Duplicate => {
                if target.state == DialState::Dialing {
                    target.state = DialState::Idle;
                }
                self.penalise(addr, now);
            }
        }
    }

    /// A link to `owner` came up, by either side. `addr` is where `owner`
    /// listens, if known; matching targets stop being dialed.
    pub fn link_established(&mut self, owner: NodeId, addr: Option<SocketAddr>) {
        for target in self.targets.values_mut() {
            let matches = target.owner == Some(owner) || Some(target.addr) == addr;
            if matches && target.state != DialState::Excluded {
                target.owner = Some(owner);
                if target.state != DialState::Dialing {
                    target.state = DialState::Linked(owner);
                }
                target.failures = 0;
            }
        }
    }

    /// The link to `owner` went down; its addresses become dialable again
    /// after one backoff step.
    pub fn link_lost(&mut self, owner: NodeId, now: Instant) {
        let addrs: Vec<SocketAddr> = self
            .targets
            .values()
            .filter(|t| t.state == DialState::Linked(owner))
            .map(|t| t.addr)
            .collect();
        for addr in addrs {
            if let Some(target) = self.targets.get_mut(&addr) {
                target.state = DialState::Idle;
            }
            self.penalise(addr, now);
        }
    }

    /// Add an address learned from a peer (its listen address). Due at once.
    /// Returns true if the address was new.
    pub fn learn(&mut self, addr: SocketAddr, owner: NodeId, now: Instant) -> bool {
        match self.targets.get_mut(&addr) {
            Some(target) => {
                target.owner = Some(owner);
                if target.state == DialState::Idle {
                    target.next_attempt = now;
                }
                false
            }
            None => {
                let mut target = DialTarget::new(addr, now, true);
                target.owner = Some(owner);
                self.targets.insert(addr, target);
                true
            }
        }
    }

    fn penalise(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(target) = self.targets.get_mut(&addr) {
            target.failures = target.failures.saturating_add(1);
            target.next_attempt = now + self.backoff.delay_with_jitter(target.failures);
        }
    }

    pub fn target(&self, addr: &SocketAddr) -> Option<&DialTarget> {
        self.targets.get(addr)
    }

    pub fn targets(&self) -> impl Iterator<Item = &DialTarget> {
        self.targets.values()
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Counts: (idle, dialing, linked, excluded).
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut idle = 0;
        let mut dialing = 0;
        let mut linked = 0;
        let mut excluded = 0;
        for t in self.targets.values() {
            match t.state {
                DialState::Idle => idle += 1,
                DialState::Dialing => dialing += 1,
                DialState::Linked(_) => linked += 1,
                DialState::Excluded => excluded += 1,
            }
        }
        (idle, dialing, linked, excluded)
    }
}
