//! UDP multicast transport.
//!
//! Every node joins one group and port. A send is one datagram to the group,
//! so it reaches all peers at once. Membership is heartbeat based: a peer
//! appears on its first datagram and disappears after `silence_timeout`
//! without one, or immediately on LEAVE. No ordering, no retransmission.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cachemesh_membership::{Liveness, Observation};
use cachemesh_protocol::{
    Charset, Command, Datagram, Message, Node, NodeId, ProtocolError, ReceivedMessage,
    DATAGRAM_HEADER_BYTES, DEFAULT_TIMING,
};
use futures::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;

use crate::pool::PeerSummary;
use crate::shared::{bump, ChannelCore};
use crate::{ChannelError, ChannelStats, ClusterChannel, Pingable, Result, TransportKind};
use crate::{HandlerId, MessageHandler, PresenceHandler};

const RECV_BUFFER_BYTES: usize = 65_536;

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Group address and port, e.g. `239.255.27.1:45588`.
    pub group: SocketAddr,
    /// Local IPv4 interface to join on. Default: chosen by the OS.
    pub interface: Option<Ipv4Addr>,
    pub ttl: u32,
    /// Deliver our own datagrams back to this host (needed for several
    /// nodes on one machine).
    pub loopback: bool,
    pub charset: Charset,
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub silence_timeout: Duration,
    pub max_datagram_bytes: usize,
}

impl MulticastConfig {
    pub fn new(group: SocketAddr) -> Self {
        let t = &DEFAULT_TIMING;
        Self {
            group,
            interface: None,
            ttl: t.multicast_ttl,
            loopback: true,
            charset: Charset::default(),
            queue_capacity: t.send_queue_capacity,
            heartbeat_interval: Duration::from_millis(t.multicast_heartbeat_interval_ms),
            silence_timeout: Duration::from_millis(t.multicast_silence_timeout_ms),
            max_datagram_bytes: t.max_datagram_bytes,
        }
    }
}

/// Cluster channel over one UDP multicast group.
pub struct MulticastChannel {
    inner: Arc<MulticastInner>,
}

struct MulticastInner {
    id: NodeId,
    core: ChannelCore,
    config: MulticastConfig,
    liveness: Mutex<Liveness>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// Wakes the heartbeat task for an immediate probe.
    probe: Notify,
    in_flight: AtomicUsize,
}

impl MulticastChannel {
    pub fn new(config: MulticastConfig) -> Self {
        Self {
            inner: Arc::new(MulticastInner {
                id: NodeId::random(),
                core: ChannelCore::new(TransportKind::Multicast, config.queue_capacity),
                liveness: Mutex::new(Liveness::new(config.silence_timeout)),
                config,
                socket: Mutex::new(None),
                probe: Notify::new(),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let rx = inner.core.begin_init()?;

        let socket = match bind_multicast(&inner.config).and_then(UdpSocket::from_std) {
            Ok(socket) => Arc::new(socket),
            Err(source) => {
                inner.core.abort_init();
                return Err(ChannelError::Bind {
                    addr: inner.config.group,
                    source,
                });
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => match inner.config.interface {
                Some(iface) => SocketAddr::new(IpAddr::V4(iface), addr.port()),
                None => addr,
            },
            Err(e) => {
                inner.core.abort_init();
                return Err(e.into());
            }
        };
        *inner.socket() = Some(socket.clone());

        let local = Node::new(inner.id, local_addr);
        inner.core.finish_init(local.clone());
        tracing::info!(
            node = %local,
            group = %inner.config.group,
            "multicast channel started"
        );

        tokio::spawn(receive_loop(inner.clone(), socket.clone()));
        tokio::spawn(heartbeat_loop(inner.clone(), socket.clone()));
        tokio::spawn(sender_loop(inner.clone(), socket, rx));
        Ok(())
    }
}

impl MulticastInner {
    fn liveness(&self) -> MutexGuard<'_, Liveness> {
        self.liveness.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn socket(&self) -> MutexGuard<'_, Option<Arc<UdpSocket>>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse messages that would not fit one datagram.
    fn check_size(&self, message: &Message) -> Result<()> {
        let max = self.config.max_datagram_bytes;
        if message.len() > Datagram::max_payload(max) {
            return Err(ProtocolError::MessageTooLarge {
                size: DATAGRAM_HEADER_BYTES + message.len(),
                max,
            }
            .into());
        }
        Ok(())
    }

    fn control_datagram(&self, command: Command) -> Option<Bytes> {
        Datagram::new(command, self.id, Bytes::new())
            .encode(self.config.max_datagram_bytes)
            .ok()
    }

    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let datagram = match Datagram::decode(bytes) {
            Ok(d) => d,
            Err(e) => {
                bump(&self.core.counters.messages_dropped);
                tracing::debug!(
                    %from,
                    prefix = %hex::encode(&bytes[..bytes.len().min(16)]),
                    "undecodable datagram: {e}"
                );
                return;
            }
        };
        if datagram.sender == self.id {
            return;
        }
        let node = Node::new(datagram.sender, from);

        if datagram.command == Command::LEAVE {
            let left = self.liveness().forget(&datagram.sender);
            if let Some(peer) = left {
                self.core.node_left(&peer.node);
            }
            return;
        }

        let observation = self.liveness().observe(node.clone(), Instant::now());
        match observation {
            Observation::Joined => self.core.node_entered(&node),
            Observation::Moved { previous } => {
                tracing::debug!(peer = %node, %previous, "peer address changed")
            }
            Observation::Refreshed => {}
        }

        if datagram.command.is_control() {
            return;
        }
        let message = Message::from_wire(datagram.command, datagram.payload, self.config.charset);
        self.core
            .dispatch_message(&ReceivedMessage::new(message, node));
    }

    fn reap(&self) {
        let gone = self.liveness().reap(Instant::now());
        for node in gone {
            tracing::debug!(peer = %node, "peer silent past timeout");
            self.core.node_left(&node);
        }
    }
}

fn bind_multicast(config: &MulticastConfig) -> io::Result<std::net::UdpSocket> {
    let group = config.group;
    if !group.ip().is_multicast() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a multicast address", group.ip()),
        ));
    }

    let domain = if group.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    match group.ip() {
        IpAddr::V4(addr) => {
            let iface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&addr, &iface)?;
            socket.set_multicast_if_v4(&iface)?;
            socket.set_multicast_loop_v4(config.loopback)?;
            socket.set_multicast_ttl_v4(config.ttl)?;
            let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port());
            socket.bind(&bind.into())?;
        }
        IpAddr::V6(addr) => {
            socket.join_multicast_v6(&addr, 0)?;
            socket.set_multicast_loop_v6(config.loopback)?;
            socket.set_multicast_hops_v6(config.ttl)?;
            let bind = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), group.port());
            socket.bind(&bind.into())?;
        }
    }
    Ok(socket.into())
}

async fn receive_loop(inner: Arc<MulticastInner>, socket: Arc<UdpSocket>) {
    let cancel = inner.core.cancel.clone();
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        match received {
            Ok((len, from)) => inner.handle_datagram(&buf[..len], from),
            Err(e) => {
                tracing::debug!("multicast receive failed: {e}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    tracing::debug!("multicast receiver stopped");
}

async fn heartbeat_loop(inner: Arc<MulticastInner>, socket: Arc<UdpSocket>) {
    let cancel = inner.core.cancel.clone();
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let Some(probe) = inner.control_datagram(Command::HEARTBEAT) else {
        tracing::warn!("max datagram size too small for heartbeats");
        return;
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = inner.probe.notified() => {}
        }
        if let Err(e) = socket.send_to(&probe, inner.config.group).await {
            tracing::debug!("heartbeat send failed: {e}");
        }
        inner.reap();
    }
    tracing::debug!("multicast heartbeat stopped");
}

async fn sender_loop(
    inner: Arc<MulticastInner>,
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<Message>,
) {
    let cancel = inner.core.cancel.clone();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };

        inner.in_flight.store(1, Ordering::Relaxed);
        let datagram = Datagram::new(message.command(), inner.id, message.payload().clone());
        match datagram.encode(inner.config.max_datagram_bytes) {
            Ok(bytes) => match socket.send_to(&bytes, inner.config.group).await {
                Ok(_) => bump(&inner.core.counters.messages_sent),
                Err(e) => {
                    bump(&inner.core.counters.messages_dropped);
                    tracing::warn!(command = %message.command(), "multicast send failed: {e}");
                }
            },
            Err(e) => {
                bump(&inner.core.counters.messages_dropped);
                tracing::warn!(command = %message.command(), "message dropped: {e}");
            }
        }
        inner.in_flight.store(0, Ordering::Relaxed);
    }
    tracing::debug!("multicast sender stopped");
}

impl ClusterChannel for MulticastChannel {
    fn init(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.start())
    }

    fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerId {
        self.inner.core.register_message_handler(handler)
    }

    fn unregister_message_handler(&self, id: HandlerId) -> bool {
        self.inner.core.unregister_message_handler(id)
    }

    fn register_presence_handler(&self, handler: Arc<dyn PresenceHandler>) -> HandlerId {
        self.inner.core.register_presence_handler(handler)
    }

    fn unregister_presence_handler(&self, id: HandlerId) -> bool {
        self.inner.core.unregister_presence_handler(id)
    }

    fn send(&self, message: Message) -> Result<()> {
        self.inner.check_size(&message)?;
        self.inner.core.enqueue(message)
    }

    fn send_timeout(&self, message: Message, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner.check_size(&message)?;
            self.inner.core.enqueue_timeout(message, timeout).await
        })
    }

    fn nodes(&self) -> Vec<Node> {
        self.inner.liveness().nodes()
    }

    fn peer_details(&self) -> Vec<PeerSummary> {
        let now = Instant::now();
        let live = self.inner.liveness();
        let mut out: Vec<PeerSummary> = live
            .peers()
            .map(|p| PeerSummary {
                connected_secs: Some(now.saturating_duration_since(p.first_seen).as_secs()),
                last_seen_ms: Some(now.saturating_duration_since(p.last_seen).as_millis() as u64),
                messages_received: p.observations,
                ..PeerSummary::from_node(&p.node)
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    fn sending_queue_size(&self) -> usize {
        self.inner.core.queued() + self.inner.in_flight.load(Ordering::Relaxed)
    }

    fn local_node(&self) -> Option<Node> {
        self.inner.core.local_node()
    }

    fn close(&self) {
        if !self.inner.core.close() {
            return;
        }
        let socket = self.inner.socket().take();
        if let (Some(socket), Some(leave)) = (socket, self.inner.control_datagram(Command::LEAVE)) {
            if let Err(e) = socket.try_send_to(&leave, self.inner.config.group) {
                tracing::debug!("leave announcement not sent: {e}");
            }
        }
        self.inner.liveness().clear();
        tracing::info!(node = %self.inner.id.short(), "multicast channel closed");
    }

    fn as_pingable(&self) -> Option<&dyn Pingable> {
        Some(self)
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Multicast
    }

    fn stats(&self) -> ChannelStats {
        self.inner.core.stats(self.sending_queue_size())
    }
}

impl Pingable for MulticastChannel {
    /// Heartbeat now instead of at the next tick.
    fn ping(&self) {
        self.inner.probe.notify_one();
    }
}

impl Drop for MulticastChannel {
    fn drop(&mut self) {
        self.close();
    }
}
