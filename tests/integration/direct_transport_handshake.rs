//! Two real QUIC [`DirectTransport`] endpoints, manually wired the way
//! the peer manager wires them: `connect()`'s `Offer` signal goes to
//! the peer's `handle_signal`, whose `Answer` goes back, after which
//! both sides see `PeerConnected` and can exchange application bytes.
//!
//! No relay is involved here — the signaling transport is simulated by
//! hand, which is exactly the seam `PeerManager::spawn_event_pumps`
//! wires in production (direct's outbound signals -> relay ->
//! direct's `handle_signal`).

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use mesh_core::transport::direct::DirectTransport;
use mesh_core::transport::{Transport, TransportEvent};
use mesh_proto::{PeerAddress, PeerId};

fn loopback_address(peer_id: PeerId) -> PeerAddress {
    PeerAddress { peer_id, relay: None, direct: true, dht: None, local: None, display_name: String::new(), color: String::new(), last_seen: 0 }
}

async fn recv_within(rx: &mut tokio::sync::mpsc::UnboundedReceiver<TransportEvent>, label: &str) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {label}"))
        .unwrap_or_else(|| panic!("event channel closed waiting for {label}"))
}

#[tokio::test]
async fn offer_answer_handshake_establishes_a_bidirectional_link() {
    let a_id = PeerId::random();
    let b_id = PeerId::random();

    let a = DirectTransport::new(a_id, "127.0.0.1:0".parse().unwrap());
    let b = DirectTransport::new(b_id, "127.0.0.1:0".parse().unwrap());
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    let mut a_signals = a.take_outbound_signals().unwrap();
    let mut b_signals = b.take_outbound_signals().unwrap();

    // A initiates: its connect() queues an Offer destined for B.
    a.connect(b_id, &loopback_address(b_id)).await.unwrap();
    assert!(!a.is_connected(b_id));

    let (target, offer) = tokio::time::timeout(Duration::from_secs(5), a_signals.recv()).await.unwrap().unwrap();
    assert_eq!(target, b_id);

    // Deliver the offer to B; B answers with its listen address.
    b.handle_signal(a_id, offer).await.unwrap();
    let (target, answer) = tokio::time::timeout(Duration::from_secs(5), b_signals.recv()).await.unwrap().unwrap();
    assert_eq!(target, a_id);

    // Deliver the answer to A; A dials B's QUIC endpoint.
    a.handle_signal(b_id, answer).await.unwrap();

    // Both sides observe the connection coming up.
    let a_event = recv_within(&mut a_events, "A's PeerConnected").await;
    assert!(matches!(a_event, TransportEvent::PeerConnected { peer } if peer == b_id));
    let b_event = recv_within(&mut b_events, "B's PeerConnected").await;
    assert!(matches!(b_event, TransportEvent::PeerConnected { peer } if peer == a_id));

    assert!(a.is_connected(b_id));
    assert!(b.is_connected(a_id));

    // Application bytes now flow in both directions over the same link.
    a.send(b_id, b"hello from a").await.unwrap();
    let b_message = recv_within(&mut b_events, "B's Message").await;
    match b_message {
        TransportEvent::Message { peer, payload } => {
            assert_eq!(peer, a_id);
            assert_eq!(payload, b"hello from a");
        }
        other => panic!("expected Message, got {other:?}"),
    }

    b.send(a_id, b"hello from b").await.unwrap();
    let a_message = recv_within(&mut a_events, "A's Message").await;
    match a_message {
        TransportEvent::Message { peer, payload } => {
            assert_eq!(peer, b_id);
            assert_eq!(payload, b"hello from b");
        }
        other => panic!("expected Message, got {other:?}"),
    }
}

#[tokio::test]
async fn glare_is_resolved_by_the_larger_peer_id_rolling_back() {
    // Construct two ids whose ordering we control, so the test doesn't
    // depend on which random id happens to be larger.
    let mut low_bytes = [0u8; 16];
    let mut high_bytes = [0xff; 16];
    low_bytes[0] = 0x00;
    high_bytes[0] = 0xff;
    let low_id = PeerId::from_bytes(low_bytes);
    let high_id = PeerId::from_bytes(high_bytes);
    assert!(low_id < high_id);

    let low = DirectTransport::new(low_id, "127.0.0.1:0".parse().unwrap());
    let high = DirectTransport::new(high_id, "127.0.0.1:0".parse().unwrap());
    low.initialize().await.unwrap();
    high.initialize().await.unwrap();

    let mut low_signals = low.take_outbound_signals().unwrap();
    let mut high_signals = high.take_outbound_signals().unwrap();
    let mut low_events = low.subscribe();
    let mut high_events = high.subscribe();

    // Both sides offer simultaneously (glare).
    low.connect(high_id, &loopback_address(high_id)).await.unwrap();
    high.connect(low_id, &loopback_address(low_id)).await.unwrap();

    let (_, low_offer) = tokio::time::timeout(Duration::from_secs(5), low_signals.recv()).await.unwrap().unwrap();
    let (_, high_offer) = tokio::time::timeout(Duration::from_secs(5), high_signals.recv()).await.unwrap().unwrap();

    // Deliver each side's offer to the other.
    high.handle_signal(low_id, low_offer).await.unwrap();
    low.handle_signal(high_id, high_offer).await.unwrap();

    // `high` is the larger id: it rolls back its own offer and answers
    // `low`'s instead. `low` (the smaller id) drops `high`'s incoming
    // offer and waits for its own to be answered, so exactly one Answer
    // signal is produced, from `high`.
    let (target, answer) = tokio::time::timeout(Duration::from_secs(5), high_signals.recv()).await.unwrap().unwrap();
    assert_eq!(target, low_id);

    low.handle_signal(high_id, answer).await.unwrap();

    let low_event = recv_within(&mut low_events, "low's PeerConnected").await;
    assert!(matches!(low_event, TransportEvent::PeerConnected { peer } if peer == high_id));
    let high_event = recv_within(&mut high_events, "high's PeerConnected").await;
    assert!(matches!(high_event, TransportEvent::PeerConnected { peer } if peer == low_id));
}
