//! `PeerManager::send_update`/`broadcast`/`send` over a real relay link,
//! end to end: the exact bytes produced by `send_update`'s
//! frame-then-base64-then-envelope encoding are what the other side's
//! `MeshEvent::Sync` carries, and unicast `send` only succeeds once a
//! transport actually reports the peer reachable.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine as _;
use mesh_core::peer_manager::{MeshEvent, PeerManager};
use mesh_core::MeshError;
use mesh_proto::{encode_control, frame_encode, Envelope, PeerId};

fn unused_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn make_manager(relay_url: &str, display_name: &str) -> (PeerManager, tokio::sync::mpsc::UnboundedReceiver<MeshEvent>) {
    PeerManager::new(PeerId::random(), display_name.to_string(), String::new(), relay_url, unused_addr(), unused_addr(), 0, 50)
}

async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<MeshEvent>, what: &str) -> MeshEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("event channel closed waiting for {what}"))
}

/// Drains events until a `Sync` arrives, returning it and any `PeerJoined`
/// address observed along the way (there is exactly one, for the sender).
async fn next_sync_and_sender(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<MeshEvent>,
    what: &str,
) -> (String, Vec<u8>, Option<PeerId>) {
    let mut sender = None;
    loop {
        match next_event(rx, what).await {
            MeshEvent::PeerJoined { peer } => sender = Some(peer.peer_id),
            MeshEvent::Sync { doc_id, data, .. } => return (doc_id, data, sender),
            _ => {}
        }
    }
}

#[tokio::test]
async fn send_update_delivers_the_exact_ciphertext_to_every_other_peer() {
    let (relay_addr, _server_handle) = mesh_relay::server::start_server("127.0.0.1:0").await.expect("relay server should start");
    let relay_url = format!("ws://{relay_addr}/ws");

    let (alice, _alice_events) = make_manager(&relay_url, "alice");
    alice.join_workspace("send-paths-workspace").await.unwrap();
    let (bob, mut bob_events) = make_manager(&relay_url, "bob");
    bob.join_workspace("send-paths-workspace").await.unwrap();

    let ciphertext = b"already-encrypted crdt delta bytes";
    alice.send_update("shared-doc", ciphertext).await.expect("send_update should succeed");

    let (doc_id, data, _sender) = next_sync_and_sender(&mut bob_events, "bob's Sync event").await;
    assert_eq!(doc_id, "shared-doc");
    assert_eq!(data, ciphertext);

    alice.leave_workspace().await;
    bob.leave_workspace().await;
}

#[tokio::test]
async fn send_to_a_peer_with_no_open_transport_fails_with_no_transport() {
    let (relay_addr, _server_handle) = mesh_relay::server::start_server("127.0.0.1:0").await.expect("relay server should start");
    let relay_url = format!("ws://{relay_addr}/ws");

    let (alice, _alice_events) = make_manager(&relay_url, "alice");
    alice.join_workspace("lonely-workspace").await.unwrap();

    let ghost = PeerId::random();
    let result = alice.send(ghost, b"nobody is there").await;
    assert!(matches!(result, Err(MeshError::NoTransport(peer)) if peer == ghost));

    alice.leave_workspace().await;
}

#[tokio::test]
async fn unicast_send_succeeds_once_the_peer_is_confirmed_reachable() {
    let (relay_addr, _server_handle) = mesh_relay::server::start_server("127.0.0.1:0").await.expect("relay server should start");
    let relay_url = format!("ws://{relay_addr}/ws");

    let (alice, mut alice_events) = make_manager(&relay_url, "alice");
    alice.join_workspace("unicast-workspace").await.unwrap();
    let (bob, mut bob_events) = make_manager(&relay_url, "bob");
    bob.join_workspace("unicast-workspace").await.unwrap();

    // Broadcasting first is what confirms bob's relay link to alice (an
    // `Inbound` origin marks that peer `Open` on the receiving side) and
    // hands bob alice's peer id via the `PeerJoined` event that fires
    // alongside it.
    alice.send_update("doc-1", b"warm up the link").await.unwrap();
    let (_, _, sender) = next_sync_and_sender(&mut bob_events, "bob's warm-up Sync").await;
    let alice_id = sender.expect("bob should have learned alice's peer id from PeerJoined");

    // Bob unicasts straight to alice instead of broadcasting.
    let frame = frame_encode("doc-2", b"direct reply").unwrap();
    let data = base64::engine::general_purpose::STANDARD.encode(frame);
    let envelope = Envelope::Sync { doc_id: "doc-2".to_string(), data, origin: PeerId::random(), timestamp: 0 };
    let bytes = encode_control(&envelope).unwrap();

    bob.send(alice_id, &bytes).await.expect("bob's relay link to alice should be open");

    let event = next_event(&mut alice_events, "alice's reply Sync").await;
    match event {
        MeshEvent::Sync { doc_id, data, .. } => {
            assert_eq!(doc_id, "doc-2");
            assert_eq!(data, b"direct reply");
        }
        other => panic!("expected Sync, got {other:?}"),
    }

    alice.leave_workspace().await;
    bob.leave_workspace().await;
}
