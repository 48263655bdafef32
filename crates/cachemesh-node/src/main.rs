//! Cachemesh Node -- cluster-wide cache invalidation node.
//!
//! Usage:
//!   cachemesh-node                      # Run with default config
//!   cachemesh-node --config path.toml   # Run with custom config
//!   cachemesh-node status               # Query the running node

use cachemesh_node::config::{self, NodeConfig};
use cachemesh_node::{expand_tilde, load_or_create_token, CacheNode};

use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cachemesh-node", about = "Cluster-wide cache invalidation node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.cachemesh/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show node status (queries local API)
    Status,
    /// List known peers
    Peers,
    /// Show invalidation history and counters
    Diagnostics,
    /// Force an immediate liveness probe
    Ping,
    /// Store a value in a local cache (values never leave this node)
    Put {
        cache: String,
        key: String,
        value: String,
    },
    /// Read a value from a local cache
    Get { cache: String, key: String },
    /// Remove a key locally and on every peer
    Remove { cache: String, key: String },
    /// Clear a cache locally and on every peer
    Clear { cache: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cachemesh_node=info,cachemesh_channel=info,cachemesh_invalidation=info,cachemesh_api=info"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = config::NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
        Some(Commands::Status) => {
            cli_api_call(&cfg, "/api/v1/status", serde_json::json!({})).await?;
        }
        Some(Commands::Peers) => {
            cli_api_call(&cfg, "/api/v1/peers", serde_json::json!({})).await?;
        }
        Some(Commands::Diagnostics) => {
            cli_api_call(&cfg, "/api/v1/diagnostics", serde_json::json!({})).await?;
        }
        Some(Commands::Ping) => {
            cli_api_call(&cfg, "/api/v1/ping", serde_json::json!({})).await?;
        }
        Some(Commands::Put { cache, key, value }) => {
            let body = serde_json::json!({ "cache": cache, "key": key, "value": value });
            cli_api_call(&cfg, "/api/v1/cache/put", body).await?;
        }
        Some(Commands::Get { cache, key }) => {
            let body = serde_json::json!({ "cache": cache, "key": key });
            cli_api_call(&cfg, "/api/v1/cache/get", body).await?;
        }
        Some(Commands::Remove { cache, key }) => {
            let body = serde_json::json!({ "cache": cache, "key": key });
            cli_api_call(&cfg, "/api/v1/cache/remove", body).await?;
        }
        Some(Commands::Clear { cache }) => {
            let body = serde_json::json!({ "cache": cache });
            cli_api_call(&cfg, "/api/v1/cache/clear", body).await?;
        }
    }

    Ok(())
}

/// Make a POST request to the local node API and print the JSON response.
async fn cli_api_call(
    cfg: &NodeConfig,
    path: &str,
    body: serde_json::Value,
) -> anyhow::Result<()> {
    let addr = cfg.node.api_addr.as_deref().unwrap_or("127.0.0.1:9573");
    let url = format!("http://{}{}", addr, path);

    let token_path = expand_tilde(&cfg.node.token_path);
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {}", token))
        .json(&body)
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = cfg.transport.kind(),
        caches = cfg.caches.len(),
        "starting cachemesh-node"
    );
    tracing::info!(
        api_transport = %cfg.node.api_transport,
        api_addr = cfg.node.api_addr.as_deref().unwrap_or("(default)"),
        "api config"
    );

    // Load bearer token
    let token_path = expand_tilde(&cfg.node.token_path);
    let bearer_token = load_or_create_token(&token_path)?;

    let node = CacheNode::start(&cfg).await?;

    // Shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_signal = |tx: &tokio::sync::broadcast::Sender<()>| {
        let mut rx = tx.subscribe();
        async move {
            let _ = rx.recv().await;
        }
    };

    // Start API server
    let router = cachemesh_api::router(Arc::new(node.app_state(bearer_token)));

    let api_handle = match cfg.node.api_transport.as_str() {
        "http" => {
            let addr = cfg.node.api_addr.as_deref().unwrap_or("127.0.0.1:9573");
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    node.shutdown();
                    return Err(e.into());
                }
            };
            tracing::info!(addr, "API listening (HTTP)");
            let shutdown = shutdown_signal(&shutdown_tx);
            tokio::spawn(async move {
                if let Err(e) = cachemesh_api::serve_http(listener, router, shutdown).await {
                    tracing::error!("api server failed: {e}");
                }
            })
        }
        #[cfg(unix)]
        "unix" => {
            let sock_path = expand_tilde(
                cfg.node
                    .api_socket
                    .as_deref()
                    .unwrap_or("~/.cachemesh/node.sock"),
            );
            let _ = std::fs::remove_file(&sock_path);
            let bound = match sock_path.parent() {
                Some(parent) => std::fs::create_dir_all(parent),
                None => Ok(()),
            }
            .and_then(|()| tokio::net::UnixListener::bind(&sock_path));
            let listener = match bound {
                Ok(l) => l,
                Err(e) => {
                    node.shutdown();
                    return Err(e.into());
                }
            };
            tracing::info!(path = %sock_path.display(), "API listening (Unix socket)");
            let shutdown = shutdown_signal(&shutdown_tx);
            tokio::spawn(cachemesh_api::serve_unix(listener, router, shutdown))
        }
        other => {
            node.shutdown();
            anyhow::bail!("unsupported api_transport: {other}");
        }
    };

    tracing::info!("node running, press Ctrl-C to stop");

    // Wait for shutdown signal
    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down...");

    // Bridge, then channel, then API
    node.shutdown();
    let _ = shutdown_tx.send(());
    let _ = api_handle.await;

    signal?;
    tracing::info!("shutdown complete");
    Ok(())
}
