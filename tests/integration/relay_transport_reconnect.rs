//! Reconnect behavior of [`RelayTransport`] against a real rendezvous
//! server.
//!
//! Aborting the server's own accept task does not close an
//! already-upgraded WebSocket (the per-connection task lives on its
//! own). To simulate a real network partition we put a TCP proxy in
//! front of the relay and kill the proxy's connections instead — the
//! same technique the teacher's own relay-reconnect suite uses.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use mesh_core::transport::relay::RelayTransport;
use mesh_core::transport::{Transport, TransportEvent};
use mesh_proto::{PeerId, Topic};
use parking_lot::Mutex;

struct TcpProxy {
    client_addr: String,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("proxy bind failed");
        let client_addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let Ok((mut client_stream, _)) = listener.accept().await else { break };
                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await else { return };
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream).await;
                });
                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self { client_addr, accept_handle, conn_handles }
    }

    fn kill(&self) {
        for handle in self.conn_handles.lock().drain(..) {
            handle.abort();
        }
    }

    fn stop_accepting(self) {
        self.accept_handle.abort();
    }
}

async fn wait_until<F: Fn() -> bool>(pred: F, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn relay_transport_reconnects_after_the_link_is_severed() {
    let (relay_addr, _server_handle) = mesh_relay::server::start_server("127.0.0.1:0").await.expect("relay server should start");

    let proxy = TcpProxy::new(&relay_addr.to_string()).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let peer_id = PeerId::random();
    let relay = RelayTransport::new(peer_id, proxy_url);
    let mut events = relay.subscribe();

    relay.initialize().await.unwrap();
    wait_until(|| relay.is_link_open(), Duration::from_secs(5), "initial connection").await;

    let topic = Topic::for_workspace("reconnect-workspace");
    relay.join_topic(topic).await.unwrap();
    let peers = relay.request_peers(topic).await;
    assert!(peers.is_empty(), "no other peer has joined yet");

    // Sever the link.
    proxy.kill();

    // The supervisor should report the failure and drop the link.
    let err_event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert!(matches!(err_event, TransportEvent::Error { .. }));
    wait_until(|| !relay.is_link_open(), Duration::from_secs(5), "link to go down").await;

    // Give the backoff-then-reconnect loop time to bring the link back
    // up through the still-running proxy.
    wait_until(|| relay.is_link_open(), Duration::from_secs(15), "automatic reconnect").await;

    // The topic is rejoined automatically on reconnect (current_topic
    // survives the drop) — a fresh request_peers still works.
    let peers_after_reconnect = relay.request_peers(topic).await;
    assert!(peers_after_reconnect.is_empty());

    proxy.stop_accepting();
}

#[tokio::test]
async fn a_second_peer_sees_messages_sent_after_reconnect() {
    let (relay_addr, _server_handle) = mesh_relay::server::start_server("127.0.0.1:0").await.expect("relay server should start");
    let relay_url_direct = format!("ws://{relay_addr}/ws");

    let proxy = TcpProxy::new(&relay_addr.to_string()).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let alice_id = PeerId::random();
    let alice = RelayTransport::new(alice_id, proxy_url);
    alice.initialize().await.unwrap();
    wait_until(|| alice.is_link_open(), Duration::from_secs(5), "alice's initial connection").await;

    let topic = Topic::for_workspace("reconnect-roundtrip");
    alice.join_topic(topic).await.unwrap();

    proxy.kill();
    wait_until(|| !alice.is_link_open(), Duration::from_secs(5), "alice's link to drop").await;
    wait_until(|| alice.is_link_open(), Duration::from_secs(15), "alice to reconnect").await;

    // Bob connects directly (no proxy) after alice has already recovered.
    let bob_id = PeerId::random();
    let bob = RelayTransport::new(bob_id, relay_url_direct);
    let mut bob_events = bob.subscribe();
    bob.initialize().await.unwrap();
    wait_until(|| bob.is_link_open(), Duration::from_secs(5), "bob's connection").await;
    bob.join_topic(topic).await.unwrap();

    // Alice broadcasts to the topic; bob should receive it over the
    // reconnected link.
    let frame = mesh_proto::frame_encode("doc-1", b"post-reconnect update").unwrap();
    alice.relay_broadcast_topic(topic, frame).unwrap();

    // Bob's relay also treats this as alice's link coming up (first
    // `Inbound` from a peer fires `PeerConnected` before the `Message`).
    let message_event = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), bob_events.recv()).await.unwrap().unwrap();
        match event {
            TransportEvent::PeerConnected { .. } => continue,
            other => break other,
        }
    };
    match message_event {
        TransportEvent::Message { peer, payload } => {
            assert_eq!(peer, alice_id);
            let (doc_id, ciphertext) = mesh_proto::frame_decode(&payload).unwrap();
            assert_eq!(doc_id, "doc-1");
            assert_eq!(ciphertext, b"post-reconnect update");
        }
        other => panic!("expected Message, got {other:?}"),
    }

    proxy.stop_accepting();
}
