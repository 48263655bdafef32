//! Configuration types for cachemesh-node.
//! Parsed from ~/.cachemesh/config.toml.

use cachemesh_cache::KeyType;
use cachemesh_invalidation::InvalidationConfig;
use cachemesh_protocol::DEFAULT_TIMING;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub caches: Vec<CacheEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_api_transport")]
    pub api_transport: String,
    pub api_socket: Option<String>,
    pub api_addr: Option<String>,
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            api_transport: default_api_transport(),
            api_socket: Some(default_api_socket()),
            api_addr: None,
            token_path: default_token_path(),
        }
    }
}

/// Cluster transport, selected by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportSection {
    Tcp(TcpSection),
    Multicast(MulticastSection),
}

impl Default for TransportSection {
    fn default() -> Self {
        TransportSection::Tcp(TcpSection::default())
    }
}

impl TransportSection {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportSection::Tcp(_) => "tcp",
            TransportSection::Multicast(_) => "multicast",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address peers should dial, when it differs from `listen_addr`.
    pub advertised_addr: Option<String>,
    /// `host:port` of every other member.
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_tcp_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_connector_tick_ms")]
    pub connector_tick_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertised_addr: None,
            members: Vec::new(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            heartbeat_interval_ms: default_tcp_heartbeat_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            connector_tick_ms: default_connector_tick_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastSection {
    #[serde(default = "default_group")]
    pub group: String,
    /// IPv4 address of the interface to join on.
    pub interface: Option<String>,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_true")]
    pub loopback: bool,
    #[serde(default = "default_multicast_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for MulticastSection {
    fn default() -> Self {
        Self {
            group: default_group(),
            interface: None,
            ttl: default_ttl(),
            loopback: true,
            heartbeat_interval_ms: default_multicast_heartbeat_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
            max_datagram_bytes: default_max_datagram_bytes(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// One local cache, exposed through the API and kept coherent cluster-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    #[serde(default = "default_key_type")]
    pub key_type: KeyType,
}

// Default value functions
fn default_api_transport() -> String {
    "unix".into()
}
fn default_api_socket() -> String {
    "~/.cachemesh/node.sock".into()
}
fn default_token_path() -> String {
    "~/.cachemesh/node-token".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0:9574".into()
}
fn default_group() -> String {
    "239.255.27.1:45588".into()
}
fn default_true() -> bool {
    true
}
fn default_key_type() -> KeyType {
    KeyType::String
}
fn default_reconnect_base_ms() -> u64 {
    DEFAULT_TIMING.tcp_reconnect_base_ms
}
fn default_reconnect_max_ms() -> u64 {
    DEFAULT_TIMING.tcp_reconnect_max_ms
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_TIMING.tcp_connect_timeout_ms
}
fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_TIMING.tcp_handshake_timeout_ms
}
fn default_tcp_heartbeat_ms() -> u64 {
    DEFAULT_TIMING.tcp_heartbeat_interval_ms
}
fn default_idle_timeout_ms() -> u64 {
    DEFAULT_TIMING.tcp_idle_timeout_ms
}
fn default_write_timeout_ms() -> u64 {
    DEFAULT_TIMING.tcp_write_timeout_ms
}
fn default_connector_tick_ms() -> u64 {
    DEFAULT_TIMING.tcp_connector_tick_ms
}
fn default_multicast_heartbeat_ms() -> u64 {
    DEFAULT_TIMING.multicast_heartbeat_interval_ms
}
fn default_silence_timeout_ms() -> u64 {
    DEFAULT_TIMING.multicast_silence_timeout_ms
}
fn default_max_datagram_bytes() -> usize {
    DEFAULT_TIMING.max_datagram_bytes
}
fn default_ttl() -> u32 {
    DEFAULT_TIMING.multicast_ttl
}
fn default_queue_capacity() -> usize {
    DEFAULT_TIMING.send_queue_capacity
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Cache ids must be usable on the wire and unique.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for cache in &self.caches {
            cachemesh_invalidation::validate_cache_id(&cache.id)?;
            if !seen.insert(cache.id.as_str()) {
                anyhow::bail!("cache {:?} is configured twice", cache.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachemesh_protocol::Charset;

    #[test]
    fn test_default_config() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node.api_transport, "unix");
        assert_eq!(cfg.transport.kind(), "tcp");
        assert_eq!(cfg.invalidation.history_capacity, 64);
        assert!(cfg.caches.is_empty());
    }

    #[test]
    fn test_parse_tcp_toml() {
        let toml_str = r#"
[node]
api_transport = "http"
api_addr = "127.0.0.1:9573"

[transport]
kind = "tcp"
listen_addr = "0.0.0.0:9574"
members = ["10.0.0.2:9574", "10.0.0.3:9574"]
reconnect_base_ms = 250

[invalidation]
history_capacity = 16
charset = "utf8"

[[caches]]
id = "orders"
key_type = "long"

[[caches]]
id = "sessions"
"#;

        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.node.api_addr.as_deref(), Some("127.0.0.1:9573"));
        let TransportSection::Tcp(tcp) = &cfg.transport else {
            panic!("expected tcp transport");
        };
        assert_eq!(tcp.members.len(), 2);
        assert_eq!(tcp.reconnect_base_ms, 250);
        assert_eq!(tcp.reconnect_max_ms, 30_000);
        assert_eq!(cfg.invalidation.history_capacity, 16);
        assert_eq!(cfg.invalidation.charset, Charset::Utf8);
        assert_eq!(cfg.caches[0].key_type, KeyType::Long);
        assert_eq!(cfg.caches[1].key_type, KeyType::String);
    }

    #[test]
    fn test_parse_multicast_toml() {
        let toml_str = r#"
[transport]
kind = "multicast"
group = "239.1.2.3:5000"
silence_timeout_ms = 8000
"#;
        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        let TransportSection::Multicast(mc) = &cfg.transport else {
            panic!("expected multicast transport");
        };
        assert_eq!(mc.group, "239.1.2.3:5000");
        assert_eq!(mc.silence_timeout_ms, 8000);
        assert_eq!(mc.heartbeat_interval_ms, 1000);
        assert!(mc.loopback);
    }

    #[test]
    fn test_invalid_cache_ids_rejected() {
        let cfg: NodeConfig = toml::from_str(
            r#"
[[caches]]
id = "bad;id"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());

        let cfg: NodeConfig = toml::from_str(
            r#"
[[caches]]
id = "dup"
[[caches]]
id = "dup"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.transport.kind(), "tcp");
    }

    #[test]
    fn test_serialise_default() {
        let cfg = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[node]"));
        assert!(toml_str.contains("kind = \"tcp\""));
    }
}
