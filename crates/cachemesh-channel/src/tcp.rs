//! TCP full-mesh transport.
//!
//! Every node listens and dials every configured member. Only the node with
//! the smaller id initiates a link; a dial in the other direction is
//! refused with `reverse` and the acceptor dials back, so each pair ends up
//! with exactly one link even when member lists differ.
//!
//! Per link:
//!   - writer task: drains the link queue, sends heartbeats when idle
//!   - reader task: decodes frames, dispatches to handlers inline
//!
//! A fan-out task moves messages from the channel-wide queue into every
//! link queue.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use cachemesh_membership::{BackoffPolicy, DialSchedule};
use cachemesh_protocol::{
    Charset, Command, Frame, FrameCodec, Hello, Message, Node, NodeId, ProtocolError,
    ReceivedMessage, Reject, RejectReason, DEFAULT_TIMING, MAX_FRAME_BYTES,
};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use crate::pool::{LinkDirection, PeerLink, PeerPool, PeerSummary};
use crate::shared::{bump, ChannelCore};
use crate::{ChannelError, ChannelStats, ClusterChannel, Pingable, Result, TransportKind};
use crate::{HandlerId, MessageHandler, PresenceHandler};

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub listen_addr: SocketAddr,
    /// Address peers should dial, when it differs from the bound one.
    pub advertised_addr: Option<SocketAddr>,
    /// Complete member list. May include this node's own address.
    pub members: Vec<SocketAddr>,
    pub charset: Charset,
    pub queue_capacity: usize,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub connector_tick: Duration,
    /// Inbound frames declaring more than this are skipped and counted as dropped.
    pub max_frame_bytes: usize,
}

impl TcpConfig {
    pub fn new(listen_addr: SocketAddr, members: Vec<SocketAddr>) -> Self {
        let t = &DEFAULT_TIMING;
        Self {
            listen_addr,
            advertised_addr: None,
            members,
            charset: Charset::default(),
            queue_capacity: t.send_queue_capacity,
            reconnect_base: Duration::from_millis(t.tcp_reconnect_base_ms),
            reconnect_max: Duration::from_millis(t.tcp_reconnect_max_ms),
            connect_timeout: Duration::from_millis(t.tcp_connect_timeout_ms),
            handshake_timeout: Duration::from_millis(t.tcp_handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(t.tcp_heartbeat_interval_ms),
            idle_timeout: Duration::from_millis(t.tcp_idle_timeout_ms),
            write_timeout: Duration::from_millis(t.tcp_write_timeout_ms),
            connector_tick: Duration::from_millis(t.tcp_connector_tick_ms),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.reconnect_base,
            max: self.reconnect_max,
            ..BackoffPolicy::default()
        }
    }
}

/// Cluster channel over a static TCP full mesh.
pub struct TcpChannel {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    id: NodeId,
    core: ChannelCore,
    config: TcpConfig,
    pool: PeerPool,
    schedule: Mutex<DialSchedule>,
    /// Wakes the connector early (ping, learned address, lost link).
    wake: Notify,
    bound: OnceLock<SocketAddr>,
    next_link_id: AtomicU64,
}

enum DialOutcome {
    Linked,
    Rejected(Reject),
}

impl TcpChannel {
    pub fn new(config: TcpConfig) -> Self {
        let schedule = DialSchedule::new(config.members.iter().copied(), config.backoff());
        Self {
            inner: Arc::new(TcpInner {
                id: NodeId::random(),
                core: ChannelCore::new(TransportKind::Tcp, config.queue_capacity),
                config,
                pool: PeerPool::new(),
                schedule: Mutex::new(schedule),
                wake: Notify::new(),
                bound: OnceLock::new(),
                next_link_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Address the listener is bound to, once initialized.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.inner.bound.get().copied()
    }

    pub fn pool(&self) -> &PeerPool {
        &self.inner.pool
    }

    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let rx = inner.core.begin_init()?;

        let listener = match TcpListener::bind(inner.config.listen_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                inner.core.abort_init();
                return Err(ChannelError::Bind {
                    addr: inner.config.listen_addr,
                    source,
                });
            }
        };
        let bound = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                inner.core.abort_init();
                return Err(e.into());
            }
        };
        let _ = inner.bound.set(bound);

        let local = Node::new(inner.id, inner.advertised().unwrap_or(bound));
        inner.core.finish_init(local.clone());
        tracing::info!(
            node = %local,
            members = inner.config.members.len(),
            "tcp channel started"
        );

        tokio::spawn(accept_loop(inner.clone(), listener));
        tokio::spawn(connector_loop(inner.clone()));
        tokio::spawn(fanout_loop(inner.clone(), rx));
        Ok(())
    }
}

impl TcpInner {
    fn schedule(&self) -> MutexGuard<'_, DialSchedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advertised(&self) -> Option<SocketAddr> {
        self.config.advertised_addr.or_else(|| {
            self.bound
                .get()
                .copied()
                .filter(|addr| !addr.ip().is_unspecified())
        })
    }

    fn hello(&self) -> Hello {
        Hello {
            node_id: self.id,
            listen_port: self.bound.get().map(|a| a.port()).unwrap_or(0),
            advertised: self.advertised(),
        }
    }

    /// Create and insert a link. None if the channel stopped or the peer
    /// already has a link.
    fn register_link(
        &self,
        node: Node,
        remote: SocketAddr,
        direction: LinkDirection,
    ) -> Option<(Arc<PeerLink>, mpsc::UnboundedReceiver<Frame>)> {
        if !self.core.is_running() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(PeerLink::new(
            node,
            remote,
            direction,
            link_id,
            tx,
            self.core.cancel.child_token(),
        ));
        if !self.pool.insert(link.clone()) {
            return None;
        }
        Some((link, rx))
    }

    /// Split the handshaken stream and start the reader and writer tasks.
    fn spawn_link(
        self: &Arc<Self>,
        link: Arc<PeerLink>,
        framed: Framed<TcpStream, FrameCodec>,
        rx: mpsc::UnboundedReceiver<Frame>,
    ) {
        let parts = framed.into_parts();
        let (read_half, write_half) = parts.io.into_split();
        let mut reader = FramedRead::new(read_half, parts.codec);
        // Frames the peer sent right behind its handshake reply
        *reader.read_buffer_mut() = parts.read_buf;
        let writer = FramedWrite::new(write_half, self.codec());

        let inner = self.clone();
        let link_w = link.clone();
        tokio::spawn(async move {
            let token = link_w.token().clone();
            let result = tokio::select! {
                _ = token.cancelled() => Ok(()),
                r = run_writer(&inner, &link_w, writer, rx) => r,
            };
            if let Err(e) = result {
                tracing::debug!(peer = %link_w.node, "link writer stopped: {e}");
            }
            inner.teardown(&link_w);
        });

        let inner = self.clone();
        tokio::spawn(async move {
            let token = link.token().clone();
            let result = tokio::select! {
                _ = token.cancelled() => Ok(()),
                r = run_reader(&inner, &link, reader) => r,
            };
            if let Err(e) = result {
                tracing::debug!(peer = %link.node, "link reader stopped: {e}");
            }
            inner.teardown(&link);
        });
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::with_max_frame_bytes(self.config.max_frame_bytes)
    }

    /// Tear a link down once; later calls for the same link are no-ops.
    fn teardown(&self, link: &PeerLink) {
        link.token().cancel();
        if self.pool.remove(&link.node.id, link.link_id).is_some() {
            self.schedule().link_lost(link.node.id, Instant::now());
            self.core.node_left(&link.node);
            self.wake.notify_one();
        }
    }

    async fn dial(self: &Arc<Self>, addr: SocketAddr) {
        match self.dial_link(addr).await {
            Ok(DialOutcome::Linked) => {}
            Ok(DialOutcome::Rejected(reject)) => {
                tracing::debug!(
                    %addr,
                    peer = %reject.node_id.short(),
                    reason = %reject.reason,
                    "dial rejected"
                );
                // Pool checked under the schedule lock: a concurrent teardown
                // either removed the link already or will mark it lost after us
                let mut schedule = self.schedule();
                if reject.reason == RejectReason::Duplicate && self.pool.contains(&reject.node_id) {
                    schedule.dial_succeeded(addr, reject.node_id);
                } else {
                    schedule.dial_rejected(addr, reject.node_id, reject.reason, Instant::now());
                }
            }
            Err(e) => {
                bump(&self.core.counters.dial_failures);
                tracing::debug!(%addr, "dial failed: {e}");
                self.schedule().dial_failed(addr, Instant::now());
            }
        }
    }

    async fn dial_link(self: &Arc<Self>, addr: SocketAddr) -> Result<DialOutcome> {
        let cfg = &self.config;
        let stream = timeout(cfg.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("connect"))??;
        tune(&stream);

        let mut framed = Framed::new(stream, self.codec());
        let hello = Frame::control(Command::HELLO, self.hello().to_payload());
        timeout(cfg.handshake_timeout, framed.send(hello))
            .await
            .map_err(|_| timed_out("hello"))??;

        let reply = timeout(cfg.handshake_timeout, framed.next())
            .await
            .map_err(|_| timed_out("handshake reply"))?;
        let frame = match reply {
            Some(frame) => frame?,
            None => {
                return Err(ProtocolError::Handshake("closed during handshake".into()).into())
            }
        };

        match frame.command {
            Command::WELCOME => {
                let welcome = Hello::parse(&frame.payload)?;
                if welcome.node_id == self.id {
                    return Ok(DialOutcome::Rejected(Reject {
                        reason: RejectReason::SelfConnection,
                        node_id: self.id,
                    }));
                }
                let node = Node::new(welcome.node_id, addr);
                let Some((link, rx)) = self.register_link(node.clone(), addr, LinkDirection::Outbound)
                else {
                    return Ok(DialOutcome::Rejected(Reject {
                        reason: RejectReason::Duplicate,
                        node_id: welcome.node_id,
                    }));
                };
                {
                    let mut schedule = self.schedule();
                    schedule.dial_succeeded(addr, welcome.node_id);
                    schedule.link_established(welcome.node_id, Some(addr));
                }
                self.core.node_entered(&node);
                self.spawn_link(link, framed, rx);
                Ok(DialOutcome::Linked)
            }
            Command::REJECT => Ok(DialOutcome::Rejected(Reject::parse(&frame.payload)?)),
            other => Err(ProtocolError::Handshake(format!(
                "unexpected {other} frame during handshake"
            ))
            .into()),
        }
    }

    async fn accept_link(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let cfg = &self.config;
        tune(&stream);
        let mut framed = Framed::new(stream, self.codec());

        let first = timeout(cfg.handshake_timeout, framed.next())
            .await
            .map_err(|_| timed_out("hello"))?;
        let frame = match first {
            Some(frame) => frame?,
            None => return Ok(()),
        };
        if frame.command != Command::HELLO {
            return Err(ProtocolError::Handshake(format!(
                "expected hello, got {}",
                frame.command
            ))
            .into());
        }
        let hello = Hello::parse(&frame.payload)?;
        let dial_addr = hello.dial_addr(remote);

        let refusal = if hello.node_id == self.id {
            Some(RejectReason::SelfConnection)
        } else if self.pool.contains(&hello.node_id) {
            Some(RejectReason::Duplicate)
        } else if hello.node_id > self.id {
            Some(RejectReason::Reverse)
        } else {
            None
        };

        let node = Node::new(hello.node_id, dial_addr);
        let registered = match refusal {
            Some(_) => None,
            None => self.register_link(node.clone(), remote, LinkDirection::Inbound),
        };

        let Some((link, rx)) = registered else {
            let reason = refusal.unwrap_or(RejectReason::Duplicate);
            let reject = Reject {
                reason,
                node_id: self.id,
            };
            timeout(
                cfg.handshake_timeout,
                framed.send(Frame::control(Command::REJECT, reject.to_payload())),
            )
            .await
            .map_err(|_| timed_out("reject"))??;

            if reason == RejectReason::Reverse {
                if self.schedule().learn(dial_addr, hello.node_id, Instant::now()) {
                    tracing::info!(peer = %node, "learned member address from inbound dial");
                }
                self.wake.notify_one();
            }
            tracing::debug!(peer = %node, %reason, "inbound link refused");
            return Ok(());
        };

        let welcome = Frame::control(Command::WELCOME, self.hello().to_payload());
        let sent = timeout(cfg.handshake_timeout, framed.send(welcome)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.teardown(&link);
                return Err(e.into());
            }
            Err(_) => {
                self.teardown(&link);
                return Err(timed_out("welcome"));
            }
        }

        self.schedule().link_established(hello.node_id, Some(dial_addr));
        self.core.node_entered(&node);
        self.spawn_link(link, framed, rx);
        Ok(())
    }
}

async fn run_writer(
    inner: &TcpInner,
    link: &PeerLink,
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> Result<()> {
    let cfg = &inner.config;
    let hb = cfg.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + hb, hb);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let control = frame.is_control();
                let result = timeout(cfg.write_timeout, writer.send(frame)).await;
                link.frame_done();
                result.map_err(|_| timed_out("write"))??;
                if !control {
                    link.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                last_write = Instant::now();
            }
            _ = ticker.tick() => {
                if last_write.elapsed() >= hb {
                    timeout(cfg.write_timeout, writer.send(Frame::heartbeat()))
                        .await
                        .map_err(|_| timed_out("heartbeat"))??;
                    last_write = Instant::now();
                }
            }
        }
    }
}

async fn run_reader(
    inner: &TcpInner,
    link: &PeerLink,
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
) -> Result<()> {
    let cfg = &inner.config;
    loop {
        let next = timeout(cfg.idle_timeout, reader.next()).await;
        for size in reader.decoder_mut().take_discarded() {
            bump(&inner.core.counters.messages_dropped);
            tracing::warn!(
                peer = %link.node,
                size,
                max = cfg.max_frame_bytes,
                "dropped oversized frame"
            );
        }
        let frame = match next.map_err(|_| timed_out("idle read"))? {
            Some(frame) => frame?,
            None => return Ok(()),
        };

        if frame.is_control() {
            match frame.command {
                Command::HEARTBEAT => {}
                Command::LEAVE => return Ok(()),
                other => {
                    tracing::debug!(peer = %link.node, command = %other, "ignoring control frame")
                }
            }
            continue;
        }

        link.messages_received.fetch_add(1, Ordering::Relaxed);
        let message = ReceivedMessage::new(frame.into_message(cfg.charset), link.node.clone());
        inner.core.dispatch_message(&message);
    }
}

async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener) {
    let cancel = inner.core.cancel.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        let cancel = inner.core.cancel.clone();
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            r = inner.accept_link(stream, remote) => {
                                if let Err(e) = r {
                                    tracing::debug!(%remote, "inbound handshake failed: {e}");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("tcp accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::debug!("tcp accept loop stopped");
}

async fn connector_loop(inner: Arc<TcpInner>) {
    let cancel = inner.core.cancel.clone();
    let mut ticker = tokio::time::interval(inner.config.connector_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = inner.wake.notified() => {}
        }

        let due = inner.schedule().tick(Instant::now());
        for addr in due {
            let inner = inner.clone();
            tokio::spawn(async move {
                let cancel = inner.core.cancel.clone();
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = inner.dial(addr) => {}
                }
            });
        }
    }
    tracing::debug!("tcp connector stopped");
}

async fn fanout_loop(inner: Arc<TcpInner>, mut rx: mpsc::Receiver<Message>) {
    let cancel = inner.core.cancel.clone();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };

        let links = inner.pool.links();
        if links.is_empty() {
            bump(&inner.core.counters.messages_dropped);
            tracing::trace!(command = %message.command(), "no peers, message dropped");
            continue;
        }
        let frame = Frame::from(&message);
        for link in links {
            link.enqueue(frame.clone());
        }
        bump(&inner.core.counters.messages_sent);
    }
    tracing::debug!("tcp fan-out stopped");
}

fn tune(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {e}");
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("set_tcp_keepalive failed: {e}");
    }
}

fn timed_out(what: &str) -> ChannelError {
    ChannelError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{what} timed out"),
    ))
}

impl ClusterChannel for TcpChannel {
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
        self.inner.core.enqueue(message)
    }

    fn send_timeout(&self, message: Message, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.inner.core.enqueue_timeout(message, timeout))
    }

    fn nodes(&self) -> Vec<Node> {
        self.inner.pool.nodes()
    }

    fn peer_details(&self) -> Vec<PeerSummary> {
        self.inner.pool.summaries()
    }

    fn sending_queue_size(&self) -> usize {
        self.inner.core.queued() + self.inner.pool.pending_total()
    }

    fn local_node(&self) -> Option<Node> {
        self.inner.core.local_node()
    }

    fn close(&self) {
        if !self.inner.core.close() {
            return;
        }
        for link in self.inner.pool.drain() {
            link.token().cancel();
        }
        tracing::info!(node = %self.inner.id.short(), "tcp channel closed");
    }

    fn as_pingable(&self) -> Option<&dyn Pingable> {
        Some(self)
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn stats(&self) -> ChannelStats {
        self.inner.core.stats(self.sending_queue_size())
    }
}

impl Pingable for TcpChannel {
    /// Redial every idle member now and push a heartbeat down each link.
    fn ping(&self) {
        self.inner.schedule().expedite(Instant::now());
        self.inner.wake.notify_one();
        for link in self.inner.pool.links() {
            link.enqueue(Frame::heartbeat());
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}
