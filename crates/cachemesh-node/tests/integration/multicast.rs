//! UDP multicast transport. Needs a host whose loopback or default
//! interface accepts multicast, so these are opt-in:
//!
//!   cargo test --test integration multicast -- --ignored --test-threads=1

use std::net::SocketAddr;
use std::time::Duration;

use cachemesh_cache::KeyType;
use cachemesh_channel::wait_for;
use cachemesh_protocol::{Charset, Command, Message};

use crate::harness::{TestNode, TestNodeBuilder};

fn group(port: u16) -> SocketAddr {
    SocketAddr::from(([239, 255, 27, 1], port))
}

async fn pair(port: u16) -> (TestNode, TestNode) {
    let a = TestNodeBuilder::new("mc-a")
        .multicast(group(port))
        .cache("orders", KeyType::Long)
        .build()
        .await
        .unwrap();
    let b = TestNodeBuilder::new("mc-b")
        .multicast(group(port))
        .cache("orders", KeyType::Long)
        .build()
        .await
        .unwrap();
    (a, b)
}

/// Heartbeats make each node visible to the other.
#[tokio::test]
#[ignore]
async fn test_multicast_presence() {
    let (a, b) = pair(45601).await;
    a.wait_peers(1, Duration::from_secs(5)).await.unwrap();
    b.wait_peers(1, Duration::from_secs(5)).await.unwrap();
    assert_eq!(a.node.channel.nodes()[0].id, b.local().id);

    // Silence after close removes the peer
    let b_id = b.local().id;
    b.shutdown().await;
    a.wait_exact_peers(0, Duration::from_secs(5)).await.unwrap();
    assert!(a.node.channel.nodes().iter().all(|n| n.id != b_id));
    a.shutdown().await;
}

/// Application messages are delivered to the other node and never to
/// the sender.
#[tokio::test]
#[ignore]
async fn test_multicast_delivery() {
    let (a, b) = pair(45602).await;
    a.wait_peers(1, Duration::from_secs(5)).await.unwrap();

    let at_a = a.recorder();
    let at_b = b.recorder();
    let msg = Message::text(Command::from_code(0x10), "message1", Charset::Latin1).unwrap();
    a.node.channel.send(msg).unwrap();

    assert!(wait_for(|| at_b.len() == 1, Duration::from_secs(5), Duration::from_millis(10)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(at_b.texts(), vec!["message1".to_string()]);
    assert_eq!(at_a.len(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

/// Invalidation works the same over multicast.
#[tokio::test]
#[ignore]
async fn test_multicast_invalidation() {
    let (a, b) = pair(45603).await;
    a.wait_peers(1, Duration::from_secs(5)).await.unwrap();

    b.api_put("orders", "42", "pending").await.unwrap();
    a.api_remove("orders", "42").await.unwrap();

    let orders = b.node.cache("orders").unwrap().clone();
    assert!(wait_for(|| orders.is_empty(), Duration::from_secs(5), Duration::from_millis(10)).await);
    assert_eq!(b.node.bridge.stats().sent, 0);

    a.shutdown().await;
    b.shutdown().await;
}
