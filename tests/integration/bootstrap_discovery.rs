//! End-to-end peer discovery through a real rendezvous server.
//!
//! A joiner's `request_peers` call (made during `join_workspace`, before
//! it returns) seeds its bootstrap state from whoever is already on the
//! topic — but the reverse is not true: an *existing* member only
//! learns about a newcomer once some data actually arrives from them
//! (the relay's `Inbound` event, or the periodic `peer-announce`). These
//! tests exercise the direction the protocol actually guarantees:
//! later joiners discover earlier ones.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use mesh_core::peer_manager::{MeshEvent, PeerManager};
use mesh_proto::PeerId;

fn unused_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn make_manager(relay_url: &str, display_name: &str) -> (PeerManager, tokio::sync::mpsc::UnboundedReceiver<MeshEvent>) {
    PeerManager::new(PeerId::random(), display_name.to_string(), "blue".to_string(), relay_url, unused_addr(), unused_addr(), 0, 50)
}

async fn next_peer_joined(rx: &mut tokio::sync::mpsc::UnboundedReceiver<MeshEvent>, what: &str) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .unwrap_or_else(|| panic!("event channel closed waiting for {what}"));
        if let MeshEvent::PeerJoined { peer } = event {
            return peer.display_name;
        }
    }
}

#[tokio::test]
async fn a_later_joiner_is_discovered_by_the_peer_already_on_the_topic() {
    let (relay_addr, _server_handle) = mesh_relay::server::start_server("127.0.0.1:0").await.expect("relay server should start");
    let relay_url = format!("ws://{relay_addr}/ws");

    let (alice, _alice_events) = make_manager(&relay_url, "alice");
    alice.join_workspace("shared-workspace").await.expect("alice should join");

    // Bob joins second: his own `request_peers` call (inside
    // `join_workspace`) already sees alice in the rendezvous directory.
    let (bob, mut bob_events) = make_manager(&relay_url, "bob");
    bob.join_workspace("shared-workspace").await.expect("bob should join");

    // Alice's broadcast is what completes bob's relay link confirmation
    // (an `Inbound` event — the first one from a peer also fires
    // `PeerConnected`, which bob's bootstrap already has an address
    // for).
    alice.send_update("doc-1", b"alice's first update").await.expect("alice broadcast should succeed");

    let joined = next_peer_joined(&mut bob_events, "bob seeing alice join").await;
    assert_eq!(joined, "alice");

    alice.leave_workspace().await;
    bob.leave_workspace().await;
}

#[tokio::test]
async fn a_third_joiner_discovers_every_peer_already_on_the_topic() {
    let (relay_addr, _server_handle) = mesh_relay::server::start_server("127.0.0.1:0").await.expect("relay server should start");
    let relay_url = format!("ws://{relay_addr}/ws");

    let (alice, _alice_events) = make_manager(&relay_url, "alice");
    alice.join_workspace("three-peer-workspace").await.unwrap();
    let (bob, _bob_events) = make_manager(&relay_url, "bob");
    bob.join_workspace("three-peer-workspace").await.unwrap();

    let (carol, mut carol_events) = make_manager(&relay_url, "carol");
    carol.join_workspace("three-peer-workspace").await.unwrap();

    alice.send_update("doc-1", b"alice's update").await.unwrap();
    bob.send_update("doc-1", b"bob's update").await.unwrap();

    let mut seen = std::collections::HashSet::new();
    while seen.len() < 2 {
        seen.insert(next_peer_joined(&mut carol_events, "carol seeing the other two").await);
    }
    assert!(seen.contains("alice"));
    assert!(seen.contains("bob"));

    alice.leave_workspace().await;
    bob.leave_workspace().await;
    carol.leave_workspace().await;
}
