//! End-to-end cache invalidation through the API and the TCP mesh.

use std::time::Duration;

use cachemesh_cache::KeyType;
use cachemesh_channel::wait_for;

use crate::harness::{TestMesh, TestNode, TestNodeBuilder};

async fn wait_absent(node: &TestNode, cache: &str, key: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (status, _) = node.api_get(cache, key).await.unwrap();
        if status == 404 {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn invalidation_counter(node: &TestNode, name: &str) -> u64 {
    let status = node.api_status().await.unwrap();
    status["invalidation"][name].as_u64().unwrap()
}

/// Removing orders/42 on one node removes it everywhere, and the
/// receivers do not echo the removal back.
#[tokio::test]
async fn test_remove_propagates_without_echo() {
    let mesh = TestMesh::new(3, &[("orders", KeyType::Long)]).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    for node in &mesh.nodes {
        node.api_put("orders", "42", "pending").await.unwrap();
        node.api_put("orders", "43", "shipped").await.unwrap();
    }

    let removed = mesh.node(0).api_remove("orders", "42").await.unwrap();
    assert_eq!(removed["removed"], true);

    for node in &mesh.nodes[1..] {
        assert!(
            wait_absent(node, "orders", "42", Duration::from_secs(5)).await,
            "{} still holds orders/42",
            node.name
        );
        // Other keys are untouched
        let (status, body) = node.api_get("orders", "43").await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body["value"], "shipped");
    }

    assert_eq!(invalidation_counter(mesh.node(0), "sent").await, 1);
    for node in &mesh.nodes[1..] {
        assert_eq!(invalidation_counter(node, "applied").await, 1);
        assert_eq!(invalidation_counter(node, "suppressed").await, 1);
        assert_eq!(invalidation_counter(node, "sent").await, 0);
    }
    mesh.shutdown_all().await;
}

/// Clearing on the middle node empties the cache on every node.
#[tokio::test]
async fn test_clear_propagates() {
    let mesh = TestMesh::new(3, &[("sessions", KeyType::String)])
        .await
        .unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    for node in &mesh.nodes {
        for key in ["alice", "bob", "carol"] {
            node.api_put("sessions", key, "token").await.unwrap();
        }
    }

    let cleared = mesh.node(1).api_clear("sessions").await.unwrap();
    assert_eq!(cleared["entries"], 3);

    for node in &mesh.nodes {
        let cache = node.node.cache("sessions").unwrap().clone();
        assert!(
            wait_for(|| cache.is_empty(), Duration::from_secs(5), Duration::from_millis(10)).await,
            "{} still has {} sessions",
            node.name,
            cache.len()
        );
    }

    assert_eq!(invalidation_counter(mesh.node(1), "sent").await, 1);
    assert_eq!(invalidation_counter(mesh.node(0), "sent").await, 0);
    assert_eq!(invalidation_counter(mesh.node(2), "sent").await, 0);
    mesh.shutdown_all().await;
}

/// A node without the named cache ignores the invalidation.
#[tokio::test]
async fn test_unknown_cache_is_ignored() {
    let node_a = TestNodeBuilder::new("node-a")
        .cache("orders", KeyType::Long)
        .build()
        .await
        .unwrap();
    let node_b = TestNodeBuilder::new("node-b")
        .member(node_a.cluster_addr())
        .cache("sessions", KeyType::String)
        .build()
        .await
        .unwrap();
    node_a.wait_peers(1, Duration::from_secs(10)).await.unwrap();
    node_b.wait_peers(1, Duration::from_secs(10)).await.unwrap();

    node_a.api_put("orders", "7", "x").await.unwrap();
    node_a.api_clear("orders").await.unwrap();

    let bridge = node_b.node.bridge.clone();
    assert!(
        wait_for(
            || bridge.stats().ignored == 1,
            Duration::from_secs(5),
            Duration::from_millis(10)
        )
        .await
    );
    assert_eq!(bridge.stats().applied, 0);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

/// Outbound invalidations show up in the diagnostics history.
#[tokio::test]
async fn test_diagnostics_report_outbound_events() {
    let mesh = TestMesh::new(2, &[("orders", KeyType::Long)]).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let node = mesh.node(0);
    for key in ["1", "2", "3"] {
        node.api_put("orders", key, "v").await.unwrap();
        node.api_remove("orders", key).await.unwrap();
    }
    node.api_clear("orders").await.unwrap();

    let diag = node.api_diagnostics().await.unwrap();
    assert_eq!(diag["history_capacity"], 64);
    let reports = diag["reports"].as_array().unwrap();
    let count_of = |kind: &str| -> u64 {
        reports
            .iter()
            .filter(|r| r["kind"] == kind)
            .map(|r| r["count"].as_u64().unwrap())
            .sum()
    };
    assert_eq!(count_of("remove"), 3);
    assert_eq!(count_of("clear"), 1);
    assert_eq!(diag["invalidation"]["sent"], 4);
    mesh.shutdown_all().await;
}

/// Keys that do not parse as the cache's key type are refused by the API
/// and nothing is sent.
#[tokio::test]
async fn test_malformed_key_is_rejected_locally() {
    let mesh = TestMesh::new(2, &[("orders", KeyType::Long)]).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let (status, _) = mesh
        .node(0)
        .api_post_raw(
            "/api/v1/cache/remove",
            serde_json::json!({ "cache": "orders", "key": "forty-two" }),
        )
        .await
        .unwrap();
    assert_eq!(status, 400);
    assert_eq!(invalidation_counter(mesh.node(0), "sent").await, 0);
    mesh.shutdown_all().await;
}
