//! Cachemesh API -- local node HTTP/Unix socket admin API.
//!
//! Unix socket (~/.cachemesh/node.sock) or HTTP (127.0.0.1:9573).
//! Bearer token auth from ~/.cachemesh/node-token.
//! All routes are POST with a JSON body.

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use cachemesh_cache::{Cache, CacheKey, MapCache, MutationContext};
use cachemesh_channel::{ChannelStats, ClusterChannel, PeerSummary};
use cachemesh_invalidation::{
    listeners, BridgeStats, InvalidationBridge, InvalidationError, KeyCodecRegistry, ReportSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Shared state for all API handlers.
pub struct AppState {
    pub channel: Arc<dyn ClusterChannel>,
    pub bridge: Arc<InvalidationBridge>,
    /// Local caches reachable through the cache routes, by id.
    pub caches: BTreeMap<String, Arc<MapCache<String>>>,
    pub bearer_token: String,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", post(status))
        .route("/api/v1/peers", post(peers))
        .route("/api/v1/diagnostics", post(diagnostics))
        .route("/api/v1/ping", post(ping))
        .route("/api/v1/cache/put", post(cache_put))
        .route("/api/v1/cache/get", post(cache_get))
        .route("/api/v1/cache/remove", post(cache_remove))
        .route("/api/v1/cache/clear", post(cache_clear))
        .with_state(state)
}

/// Serve over TCP until `shutdown` resolves.
pub async fn serve_http(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Serve over a Unix socket until `shutdown` resolves.
#[cfg(unix)]
pub async fn serve_unix(
    listener: tokio::net::UnixListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) {
    use hyper_util::rt::TokioIo;
    use tower::Service;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let router = router.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = hyper::service::service_fn(move |req| {
                                let mut router = router.clone();
                                async move { router.call(req).await }
                            });
                            if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            )
                            .serve_connection(io, service)
                            .await
                            {
                                tracing::error!("api connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("api accept error: {e}");
                    }
                }
            }
            () = &mut shutdown => break,
        }
    }
}

// ============================================================================
// Auth middleware (inline check)
// ============================================================================

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.bearer_token);
    if auth != expected {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Deserialize)]
pub struct CacheRequest {
    pub cache: String,
}

#[derive(Deserialize)]
pub struct CacheKeyRequest {
    pub cache: String,
    pub key: String,
}

#[derive(Deserialize)]
pub struct CachePutRequest {
    pub cache: String,
    pub key: String,
    pub value: String,
}

#[derive(Serialize)]
pub struct CacheSummary {
    pub id: String,
    pub key_type: String,
    pub entries: usize,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: Option<String>,
    pub local_addr: Option<String>,
    pub transport: String,
    pub uptime_secs: u64,
    pub started_at: String,
    pub peers: usize,
    pub sending_queue_size: usize,
    pub channel: ChannelStats,
    pub invalidation: BridgeStats,
    pub caches: Vec<CacheSummary>,
}

#[derive(Serialize)]
pub struct PeersResponse {
    pub total: usize,
    pub peers: Vec<PeerSummary>,
}

#[derive(Serialize)]
pub struct DiagnosticsResponse {
    pub history_capacity: usize,
    pub capture_stack: bool,
    pub reports: Vec<ReportSnapshot>,
    pub invalidation: BridgeStats,
}

// ============================================================================
// Helpers
// ============================================================================

fn find_cache<'a>(state: &'a AppState, id: &str) -> Result<&'a Arc<MapCache<String>>, Response> {
    state
        .caches
        .get(id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown cache: {id}")).into_response())
}

/// Keys arrive as text and are decoded with the cache's declared type,
/// the same rule the bridge applies to keys off the wire.
fn decode_key(codecs: &KeyCodecRegistry, cache: &dyn Cache, text: &str) -> Result<CacheKey, Response> {
    let bad_request = |e: InvalidationError| (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    let key_type = listeners::declared_key_type(cache.id().unwrap_or_default(), cache.key_type())
        .map_err(bad_request)?;
    codecs.decode(key_type, text).map_err(bad_request)
}

// ============================================================================
// Handlers
// ============================================================================

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let local = state.channel.local_node();
    let caches = state
        .caches
        .iter()
        .map(|(id, cache)| CacheSummary {
            id: id.clone(),
            key_type: cache
                .key_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            entries: cache.len(),
        })
        .collect();

    Json(StatusResponse {
        node_id: local.as_ref().map(|n| n.id.to_string()),
        local_addr: local.as_ref().map(|n| n.addr.to_string()),
        transport: state.channel.transport().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        started_at: state.started_at.to_rfc3339(),
        peers: state.channel.nodes().len(),
        sending_queue_size: state.channel.sending_queue_size(),
        channel: state.channel.stats(),
        invalidation: state.bridge.stats(),
        caches,
    })
    .into_response()
}

async fn peers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let peers = state.channel.peer_details();
    Json(PeersResponse {
        total: peers.len(),
        peers,
    })
    .into_response()
}

async fn diagnostics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let history = state.bridge.history();
    let config = state.bridge.config();
    Json(DiagnosticsResponse {
        history_capacity: history.capacity(),
        capture_stack: config.capture_stack,
        reports: history.snapshot(),
        invalidation: state.bridge.stats(),
    })
    .into_response()
}

async fn ping(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let pinged = match state.channel.as_pingable() {
        Some(p) => {
            p.ping();
            true
        }
        None => false,
    };
    tracing::debug!(pinged, "api: liveness probe requested");
    Json(serde_json::json!({ "ok": true, "pinged": pinged })).into_response()
}

async fn cache_put(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CachePutRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    let cache = match find_cache(&state, &req.cache) {
        Ok(c) => c,
        Err(r) => return r,
    };
    let key = match decode_key(state.bridge.codecs(), cache.as_ref(), &req.key) {
        Ok(k) => k,
        Err(r) => return r,
    };

    match cache.put(key, req.value) {
        Ok(previous) => {
            Json(serde_json::json!({ "ok": true, "replaced": previous.is_some() })).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn cache_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CacheKeyRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    let cache = match find_cache(&state, &req.cache) {
        Ok(c) => c,
        Err(r) => return r,
    };
    let key = match decode_key(state.bridge.codecs(), cache.as_ref(), &req.key) {
        Ok(k) => k,
        Err(r) => return r,
    };

    match cache.get(&key) {
        Some(value) => Json(serde_json::json!({ "key": key, "value": value })).into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn cache_remove(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CacheKeyRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    let cache = match find_cache(&state, &req.cache) {
        Ok(c) => c,
        Err(r) => return r,
    };
    let key = match decode_key(state.bridge.codecs(), cache.as_ref(), &req.key) {
        Ok(k) => k,
        Err(r) => return r,
    };

    match cache.remove(&MutationContext::Local, &key) {
        Ok(previous) => {
            tracing::info!(cache = req.cache, %key, "api: key removed");
            Json(serde_json::json!({ "ok": true, "removed": previous.is_some() })).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn cache_clear(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CacheRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    let cache = match find_cache(&state, &req.cache) {
        Ok(c) => c,
        Err(r) => return r,
    };

    let entries = cache.len();
    match cache.clear(&MutationContext::Local) {
        Ok(()) => {
            tracing::info!(cache = req.cache, entries, "api: cache cleared");
            Json(serde_json::json!({ "ok": true, "entries": entries })).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}
