//! TCP mesh convergence tests.

use std::time::Duration;

use crate::harness::{build_test_runtime, scaled_timeout, test_node_count, TestMesh, TestNodeBuilder};

/// Two nodes see each other once, whoever dialled.
#[tokio::test]
async fn test_two_node_convergence() {
    let mesh = TestMesh::new(2, &[]).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let a = mesh.node(0);
    let b = mesh.node(1);
    assert_eq!(a.node.channel.nodes()[0].id, b.local().id);
    assert_eq!(b.node.channel.nodes()[0].id, a.local().id);
    mesh.shutdown_all().await;
}

/// N nodes, each knowing only earlier nodes, all reach N-1 peers.
/// Default 4, override with TEST_NODE_COUNT.
#[test]
fn test_n_node_convergence() {
    build_test_runtime(4).block_on(async {
        let n = test_node_count(4);
        let timeout = scaled_timeout(n, 10);
        let mesh = TestMesh::new(n, &[]).await.unwrap();
        mesh.wait_full_mesh(timeout).await.unwrap();

        for node in &mesh.nodes {
            let peers = node.api_peers().await.unwrap();
            assert_eq!(peers["total"].as_u64(), Some((n - 1) as u64), "{}", node.name);
        }
        mesh.shutdown_all().await;
    });
}

/// Start node A, wait, then start node B pointing at A.
#[tokio::test]
async fn test_staggered_startup() {
    let node_a = TestNodeBuilder::new("node-a").build().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(node_a.peer_count(), 0);

    let node_b = TestNodeBuilder::new("node-b")
        .member(node_a.cluster_addr())
        .build()
        .await
        .unwrap();

    node_a.wait_peers(1, Duration::from_secs(10)).await.unwrap();
    node_b.wait_peers(1, Duration::from_secs(10)).await.unwrap();

    node_a.shutdown().await;
    node_b.shutdown().await;
}

/// A member that is not up yet is retried until it appears.
#[tokio::test]
async fn test_member_started_later_is_reached() {
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let reserved = placeholder.local_addr().unwrap();
    drop(placeholder);

    let node_a = TestNodeBuilder::new("node-a")
        .member(reserved)
        .build()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node_a.peer_count(), 0);

    // Node B binds the address A has been dialling
    let node_b = TestNodeBuilder::new("node-b")
        .member(node_a.cluster_addr())
        .build_on(reserved)
        .await
        .unwrap();

    node_a.wait_peers(1, Duration::from_secs(10)).await.unwrap();
    node_b.wait_peers(1, Duration::from_secs(10)).await.unwrap();

    node_a.shutdown().await;
    node_b.shutdown().await;
}

/// Stable mesh, then one more node. Everyone sees everyone.
/// Base mesh size from TEST_NODE_COUNT (default 3).
#[test]
fn test_late_joiner() {
    build_test_runtime(4).block_on(async {
        let n = test_node_count(3);
        let timeout = scaled_timeout(n + 1, 10);
        let mut mesh = TestMesh::new(n, &[]).await.unwrap();
        mesh.wait_full_mesh(timeout).await.unwrap();

        let joiner = TestNodeBuilder::new("late-joiner")
            .members(mesh.nodes.iter().map(|node| node.cluster_addr()))
            .build()
            .await
            .unwrap();
        mesh.nodes.push(joiner);

        mesh.wait_full_mesh(timeout).await.unwrap();
        mesh.shutdown_all().await;
    });
}

/// A node that leaves disappears from every other node's view.
#[tokio::test]
async fn test_departure_is_observed() {
    let mut mesh = TestMesh::new(3, &[]).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let leaver = mesh.nodes.remove(2);
    let leaver_id = leaver.local().id;
    leaver.shutdown().await;

    for node in &mesh.nodes {
        node.wait_exact_peers(1, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(node
            .node
            .channel
            .nodes()
            .iter()
            .all(|peer| peer.id != leaver_id));
    }

    let status = mesh.node(0).api_status().await.unwrap();
    assert!(status["channel"]["peers_left"].as_u64().unwrap() >= 1);
    mesh.shutdown_all().await;
}
