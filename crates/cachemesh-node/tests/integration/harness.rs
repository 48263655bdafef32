//! Test harness for in-process cachemesh-node integration tests.
//!
//! Provides TestNode (single node with its API), TestNodeBuilder (config),
//! TestMesh (N-node orchestrator) and Recorder (message capture), all
//! running real TCP links in the same tokio runtime.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachemesh_cache::KeyType;
use cachemesh_channel::{wait_for, DispatchContext, HandlerError, MessageHandler};
use cachemesh_node::config::{
    CacheEntry, MulticastSection, NodeConfig, NodeSection, TcpSection, TransportSection,
};
use cachemesh_node::CacheNode;
use cachemesh_protocol::{Node, NodeId, ReceivedMessage};
use tokio::sync::oneshot;

/// Read TEST_NODE_COUNT from environment, falling back to `default`.
pub fn test_node_count(default: usize) -> usize {
    std::env::var("TEST_NODE_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Scale a base timeout by node count. Larger meshes need more dial rounds.
/// Formula: base_secs * ceil(n / 3), minimum = base_secs.
pub fn scaled_timeout(n: usize, base_secs: u64) -> Duration {
    let factor = ((n as f64) / 3.0).ceil().max(1.0) as u64;
    Duration::from_secs(base_secs * factor)
}

/// Build a multi-threaded runtime for tests that need real parallelism.
/// Worker count from TEST_WORKER_THREADS, falling back to `default`.
pub fn build_test_runtime(default: usize) -> tokio::runtime::Runtime {
    let workers = std::env::var("TEST_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .unwrap()
}

/// Collects every application message a node receives, in arrival order.
#[derive(Default)]
pub struct Recorder {
    received: Mutex<Vec<(NodeId, String)>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn texts(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn senders(&self) -> Vec<NodeId> {
        self.received.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl MessageHandler for Recorder {
    fn on_message(
        &self,
        _ctx: &DispatchContext,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let text = message.payload_text()?;
        self.received
            .lock()
            .unwrap()
            .push((message.sender().id, text));
        Ok(())
    }
}

/// A running in-process node: channel, caches, bridge and HTTP API.
pub struct TestNode {
    pub name: String,
    pub node: CacheNode,
    pub api_addr: SocketAddr,
    pub bearer_token: String,
    api_shutdown: Option<oneshot::Sender<()>>,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    /// Cluster address other nodes list as a member.
    pub fn cluster_addr(&self) -> SocketAddr {
        self.local().addr
    }

    pub fn local(&self) -> Node {
        self.node
            .channel
            .local_node()
            .expect("started node has a local identity")
    }

    pub fn peer_count(&self) -> usize {
        self.node.channel.nodes().len()
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        self.node.channel.register_message_handler(recorder.clone());
        recorder
    }

    /// Close bridge and channel, then stop the API.
    pub async fn shutdown(mut self) {
        self.node.shutdown();
        if let Some(tx) = self.api_shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Poll until this node sees at least `n` peers, or timeout.
    pub async fn wait_peers(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        if wait_for(|| self.peer_count() >= n, timeout, Duration::from_millis(20)).await {
            return Ok(());
        }
        anyhow::bail!(
            "{}: timeout waiting for {} peers (have {})",
            self.name,
            n,
            self.peer_count()
        )
    }

    /// Poll until this node sees exactly `n` peers, or timeout.
    pub async fn wait_exact_peers(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        if wait_for(|| self.peer_count() == n, timeout, Duration::from_millis(20)).await {
            return Ok(());
        }
        anyhow::bail!(
            "{}: timeout waiting for exactly {} peers (have {})",
            self.name,
            n,
            self.peer_count()
        )
    }

    /// POST /api/v1/status
    pub async fn api_status(&self) -> anyhow::Result<serde_json::Value> {
        self.api_post("/api/v1/status", serde_json::json!({})).await
    }

    /// POST /api/v1/peers
    pub async fn api_peers(&self) -> anyhow::Result<serde_json::Value> {
        self.api_post("/api/v1/peers", serde_json::json!({})).await
    }

    /// POST /api/v1/diagnostics
    pub async fn api_diagnostics(&self) -> anyhow::Result<serde_json::Value> {
        self.api_post("/api/v1/diagnostics", serde_json::json!({}))
            .await
    }

    pub async fn api_put(
        &self,
        cache: &str,
        key: &str,
        value: &str,
    ) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({ "cache": cache, "key": key, "value": value });
        self.api_post("/api/v1/cache/put", body).await
    }

    /// Returns (status_code, body) so callers can check for 404.
    pub async fn api_get(&self, cache: &str, key: &str) -> anyhow::Result<(u16, serde_json::Value)> {
        let body = serde_json::json!({ "cache": cache, "key": key });
        self.api_post_raw("/api/v1/cache/get", body).await
    }

    pub async fn api_remove(&self, cache: &str, key: &str) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({ "cache": cache, "key": key });
        self.api_post("/api/v1/cache/remove", body).await
    }

    pub async fn api_clear(&self, cache: &str) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({ "cache": cache });
        self.api_post("/api/v1/cache/clear", body).await
    }

    /// Raw POST returning (status_code, body_json).
    pub async fn api_post_raw(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<(u16, serde_json::Value)> {
        let url = format!("http://{}{}", self.api_addr, path);
        let client = reqwest::Client::new();
        let resp = client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.bearer_token))
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let val: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::json!({"_raw": text}));
        Ok((status, val))
    }

    async fn api_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let (_, val) = self.api_post_raw(path, body).await?;
        Ok(val)
    }
}

/// Builder for configuring and spawning a TestNode.
pub struct TestNodeBuilder {
    name: String,
    members: Vec<SocketAddr>,
    caches: Vec<CacheEntry>,
    history_capacity: usize,
    listen_addr: Option<SocketAddr>,
    multicast_group: Option<SocketAddr>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            members: vec![],
            caches: vec![],
            history_capacity: 64,
            listen_addr: None,
            multicast_group: None,
        }
    }

    pub fn member(mut self, addr: SocketAddr) -> Self {
        self.members.push(addr);
        self
    }

    pub fn members(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.members.extend(addrs);
        self
    }

    pub fn cache(mut self, id: &str, key_type: KeyType) -> Self {
        self.caches.push(CacheEntry {
            id: id.into(),
            key_type,
        });
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    fn transport(&self) -> TransportSection {
        if let Some(group) = self.multicast_group {
            return TransportSection::Multicast(MulticastSection {
                group: group.to_string(),
                heartbeat_interval_ms: 100,
                silence_timeout_ms: 600,
                ..MulticastSection::default()
            });
        }
        TransportSection::Tcp(TcpSection {
            listen_addr: self
                .listen_addr
                .map_or_else(|| "127.0.0.1:0".to_string(), |a| a.to_string()),
            members: self.members.iter().map(|a| a.to_string()).collect(),
            reconnect_base_ms: 20,
            reconnect_max_ms: 200,
            connector_tick_ms: 20,
            heartbeat_interval_ms: 200,
            idle_timeout_ms: 2_000,
            ..TcpSection::default()
        })
    }

    /// Loopback listener on an ephemeral port and fast timings so tests
    /// converge in well under a second.
    fn config(&self, tempdir: &tempfile::TempDir) -> NodeConfig {
        let mut cfg = NodeConfig {
            node: NodeSection {
                api_transport: "http".into(),
                api_socket: None,
                api_addr: None,
                token_path: tempdir.path().join("node-token").display().to_string(),
            },
            transport: self.transport(),
            caches: self.caches.clone(),
            ..NodeConfig::default()
        };
        cfg.invalidation.history_capacity = self.history_capacity;
        cfg
    }

    /// Use UDP multicast on `group` instead of the TCP mesh.
    pub fn multicast(mut self, group: SocketAddr) -> Self {
        self.multicast_group = Some(group);
        self
    }

    /// Build with the cluster listener on a fixed address.
    pub async fn build_on(mut self, listen_addr: SocketAddr) -> anyhow::Result<TestNode> {
        self.listen_addr = Some(listen_addr);
        self.build().await
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let tempdir = tempfile::tempdir()?;
        let cfg = self.config(&tempdir);
        let bearer_token = cachemesh_node::load_or_create_token(&tempdir.path().join("node-token"))?;

        let node = CacheNode::start(&cfg).await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let api_addr = listener.local_addr()?;
        let router = cachemesh_api::router(Arc::new(node.app_state(bearer_token.clone())));
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(cachemesh_api::serve_http(listener, router, async move {
            let _ = rx.await;
        }));

        Ok(TestNode {
            name: self.name,
            node,
            api_addr,
            bearer_token,
            api_shutdown: Some(tx),
            _tempdir: tempdir,
        })
    }
}

/// N-node mesh where node i lists every earlier node as a member.
/// Later nodes are reached by the reverse link, never by configuration.
pub struct TestMesh {
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestMesh {
    pub async fn new(n: usize, caches: &[(&str, KeyType)]) -> anyhow::Result<Self> {
        let mut nodes: Vec<TestNode> = Vec::with_capacity(n);
        for i in 0..n {
            let mut builder = TestNodeBuilder::new(&format!("node-{i}"))
                .members(nodes.iter().map(TestNode::cluster_addr));
            for (id, key_type) in caches {
                builder = builder.cache(id, *key_type);
            }
            nodes.push(builder.build().await?);
        }
        Ok(Self { nodes })
    }

    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Wait until every node sees every other node.
    pub async fn wait_full_mesh(&self, timeout: Duration) -> anyhow::Result<()> {
        let expected = self.nodes.len().saturating_sub(1);
        for node in &self.nodes {
            node.wait_exact_peers(expected, timeout).await?;
        }
        Ok(())
    }

    pub async fn shutdown_all(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
