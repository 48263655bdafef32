//! Application message fan-out over the TCP mesh.

use std::time::Duration;

use cachemesh_channel::wait_for;
use cachemesh_protocol::{Charset, Command, Message};

use crate::harness::TestMesh;

const APP: Command = Command::from_code(0x10);

fn text(body: &str) -> Message {
    Message::text(APP, body, Charset::Latin1).unwrap()
}

/// One send from U1 reaches U2 and U3 exactly once; U1 sees nothing.
#[tokio::test]
async fn test_broadcast_reaches_every_peer_once() {
    let mesh = TestMesh::new(3, &[]).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let recorders: Vec<_> = mesh.nodes.iter().map(|n| n.recorder()).collect();
    let sender_id = mesh.node(0).local().id;

    mesh.node(0).node.channel.send(text("message1")).unwrap();

    assert!(
        wait_for(
            || recorders[1].len() == 1 && recorders[2].len() == 1,
            Duration::from_secs(5),
            Duration::from_millis(10)
        )
        .await
    );
    // Give stragglers a chance to show up as duplicates
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(recorders[0].len(), 0);
    for recorder in &recorders[1..] {
        assert_eq!(recorder.texts(), vec!["message1".to_string()]);
        assert_eq!(recorder.senders(), vec![sender_id]);
    }
    mesh.shutdown_all().await;
}

/// Messages from one sender arrive in send order.
#[tokio::test]
async fn test_messages_from_one_sender_keep_order() {
    let mesh = TestMesh::new(3, &[]).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let recorder = mesh.node(2).recorder();
    let sent: Vec<String> = (0..100).map(|i| format!("m{i}")).collect();
    for body in &sent {
        mesh.node(0).node.channel.send(text(body)).unwrap();
    }

    assert!(
        wait_for(
            || recorder.len() == sent.len(),
            Duration::from_secs(10),
            Duration::from_millis(10)
        )
        .await
    );
    assert_eq!(recorder.texts(), sent);
    mesh.shutdown_all().await;
}

/// Sending with no peers succeeds and delivers nothing.
#[tokio::test]
async fn test_send_without_peers_is_accepted() {
    let mesh = TestMesh::new(1, &[]).await.unwrap();
    let channel = &mesh.node(0).node.channel;

    channel.send(text("alone")).unwrap();
    assert!(
        wait_for(
            || channel.sending_queue_size() == 0,
            Duration::from_secs(5),
            Duration::from_millis(10)
        )
        .await
    );
    mesh.shutdown_all().await;
}

/// After close, sends are rejected rather than queued.
#[tokio::test]
async fn test_send_after_close_is_rejected() {
    let mesh = TestMesh::new(2, &[]).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let node = mesh.node(0);
    node.node.channel.close();
    assert!(node.node.channel.send(text("late")).is_err());
    assert!(node.node.channel.local_node().is_none() || node.node.channel.nodes().is_empty());
    mesh.shutdown_all().await;
}
