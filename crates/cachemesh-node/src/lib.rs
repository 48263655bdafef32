//! Cachemesh Node -- library crate for the cache-coherence node.
//!
//! Wires config, the cluster channel, the local caches and the
//! invalidation bridge so integration tests and main.rs share one path.

pub mod config;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use cachemesh_api::AppState;
use cachemesh_cache::{InMemoryCacheRepository, MapCache};
use cachemesh_channel::{
    ClusterChannel, MulticastChannel, MulticastConfig, TcpChannel, TcpConfig,
};
use cachemesh_invalidation::InvalidationBridge;
use cachemesh_protocol::Charset;

use crate::config::{MulticastSection, NodeConfig, TcpSection, TransportSection};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Read the API bearer token, generating 48 random alphanumerics on first use.
pub fn load_or_create_token(path: &PathBuf) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated bearer token");
    Ok(token)
}

/// Resolve `host:port`, taking the first address returned.
pub async fn resolve_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(parsed) = addr.parse() {
        return Ok(parsed);
    }
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("cannot resolve {addr}"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("{addr} resolved to no addresses"))
}

pub async fn tcp_config(section: &TcpSection, charset: Charset) -> anyhow::Result<TcpConfig> {
    let listen_addr = resolve_addr(&section.listen_addr).await?;
    let mut members = Vec::with_capacity(section.members.len());
    for member in &section.members {
        match resolve_addr(member).await {
            Ok(addr) => members.push(addr),
            // A member that does not resolve yet is skipped, not fatal
            Err(e) => tracing::warn!(member = member.as_str(), "skipping member: {e}"),
        }
    }
    let advertised_addr = match &section.advertised_addr {
        Some(addr) => Some(resolve_addr(addr).await?),
        None => None,
    };

    Ok(TcpConfig {
        advertised_addr,
        charset,
        queue_capacity: section.queue_capacity,
        reconnect_base: Duration::from_millis(section.reconnect_base_ms),
        reconnect_max: Duration::from_millis(section.reconnect_max_ms),
        connect_timeout: Duration::from_millis(section.connect_timeout_ms),
        handshake_timeout: Duration::from_millis(section.handshake_timeout_ms),
        heartbeat_interval: Duration::from_millis(section.heartbeat_interval_ms),
        idle_timeout: Duration::from_millis(section.idle_timeout_ms),
        write_timeout: Duration::from_millis(section.write_timeout_ms),
        connector_tick: Duration::from_millis(section.connector_tick_ms),
        ..TcpConfig::new(listen_addr, members)
    })
}

pub fn multicast_config(
    section: &MulticastSection,
    charset: Charset,
) -> anyhow::Result<MulticastConfig> {
    let group: SocketAddr = section
        .group
        .parse()
        .with_context(|| format!("invalid multicast group {:?}", section.group))?;
    let interface = section
        .interface
        .as_deref()
        .map(str::parse::<Ipv4Addr>)
        .transpose()
        .context("invalid multicast interface")?;

    Ok(MulticastConfig {
        interface,
        ttl: section.ttl,
        loopback: section.loopback,
        charset,
        queue_capacity: section.queue_capacity,
        heartbeat_interval: Duration::from_millis(section.heartbeat_interval_ms),
        silence_timeout: Duration::from_millis(section.silence_timeout_ms),
        max_datagram_bytes: section.max_datagram_bytes,
        ..MulticastConfig::new(group)
    })
}

/// Build (but do not start) the configured cluster channel.
pub async fn build_channel(cfg: &NodeConfig) -> anyhow::Result<Arc<dyn ClusterChannel>> {
    let charset = cfg.invalidation.charset;
    let channel: Arc<dyn ClusterChannel> = match &cfg.transport {
        TransportSection::Tcp(section) => {
            Arc::new(TcpChannel::new(tcp_config(section, charset).await?))
        }
        TransportSection::Multicast(section) => {
            Arc::new(MulticastChannel::new(multicast_config(section, charset)?))
        }
    };
    Ok(channel)
}

/// A started node: channel, caches and bridge. Dropping it does not stop
/// anything; call `shutdown`.
pub struct CacheNode {
    pub channel: Arc<dyn ClusterChannel>,
    pub bridge: Arc<InvalidationBridge>,
    pub repository: Arc<InMemoryCacheRepository>,
    pub caches: BTreeMap<String, Arc<MapCache<String>>>,
}

impl CacheNode {
    /// Build and start every component. Anything already started is
    /// released again if a later step fails.
    pub async fn start(cfg: &NodeConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        let channel = build_channel(cfg).await?;
        channel
            .init()
            .await
            .with_context(|| format!("{} channel failed to start", cfg.transport.kind()))?;

        let repository = Arc::new(InMemoryCacheRepository::new());
        let mut caches = BTreeMap::new();
        for entry in &cfg.caches {
            let cache = Arc::new(MapCache::<String>::new(Some(&entry.id), entry.key_type));
            if let Err(e) = repository.insert(cache.clone()) {
                channel.close();
                return Err(e.into());
            }
            caches.insert(entry.id.clone(), cache);
        }

        let bridge = Arc::new(InvalidationBridge::new(
            channel.clone(),
            repository.clone(),
            cfg.invalidation.clone(),
        ));
        if let Err(e) = bridge.init() {
            channel.close();
            return Err(e.into());
        }
        let listener = bridge.listener();
        for cache in caches.values() {
            cache.add_listener(&listener);
        }

        if let Some(local) = channel.local_node() {
            tracing::info!(
                node = %local,
                transport = cfg.transport.kind(),
                caches = caches.len(),
                "cache node started"
            );
        }

        Ok(Self {
            channel,
            bridge,
            repository,
            caches,
        })
    }

    pub fn cache(&self, id: &str) -> Option<&Arc<MapCache<String>>> {
        self.caches.get(id)
    }

    pub fn app_state(&self, bearer_token: String) -> AppState {
        AppState {
            channel: self.channel.clone(),
            bridge: self.bridge.clone(),
            caches: self.caches.clone(),
            bearer_token,
            start_time: Instant::now(),
            started_at: chrono::Utc::now(),
        }
    }

    /// Bridge first so no invalidation is applied to a half-closed node,
    /// then the channel. Idempotent.
    pub fn shutdown(&self) {
        self.bridge.close();
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheEntry;
    use cachemesh_cache::KeyType;

    #[test]
    fn test_expand_tilde() {
        std::env::set_var("HOME", "/home/test");
        assert_eq!(
            expand_tilde("~/.cachemesh/config.toml"),
            PathBuf::from("/home/test/.cachemesh/config.toml")
        );
        assert_eq!(expand_tilde("/etc/x"), PathBuf::from("/etc/x"));
    }

    #[test]
    fn test_token_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("node-token");
        let token = load_or_create_token(&path).unwrap();
        assert_eq!(token.len(), 48);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(load_or_create_token(&path).unwrap(), token);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_tcp_config_from_section() {
        let section = TcpSection {
            listen_addr: "127.0.0.1:0".into(),
            members: vec!["127.0.0.1:9001".into(), "not a host".into()],
            reconnect_base_ms: 40,
            ..TcpSection::default()
        };
        let config = tcp_config(&section, Charset::Utf8).await.unwrap();
        assert_eq!(config.members, vec!["127.0.0.1:9001".parse().unwrap()]);
        assert_eq!(config.reconnect_base, Duration::from_millis(40));
        assert_eq!(config.charset, Charset::Utf8);
    }

    #[test]
    fn test_multicast_config_rejects_bad_interface() {
        let section = MulticastSection {
            interface: Some("eth0".into()),
            ..MulticastSection::default()
        };
        assert!(multicast_config(&section, Charset::Latin1).is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown_single_node() {
        let cfg = NodeConfig {
            transport: TransportSection::Tcp(TcpSection {
                listen_addr: "127.0.0.1:0".into(),
                ..TcpSection::default()
            }),
            caches: vec![CacheEntry {
                id: "orders".into(),
                key_type: KeyType::Long,
            }],
            ..NodeConfig::default()
        };
        let node = CacheNode::start(&cfg).await.unwrap();
        assert!(node.bridge.is_running());
        assert_eq!(node.cache("orders").unwrap().listener_count(), 1);
        assert!(node.channel.local_node().is_some());

        node.shutdown();
        assert!(!node.bridge.is_running());
        assert!(node.channel.send(cachemesh_protocol::Message::new(
            cachemesh_protocol::Command::from_code(1),
            &b"x"[..],
        )
        .unwrap())
        .is_err());
    }
}
