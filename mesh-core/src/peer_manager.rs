//! The orchestrator: owns the four transports and the bootstrap
//! membership tracker, routes decoded control envelopes to the right
//! place, and picks which transport carries a given send or broadcast.
//!
//! Grounded on the teacher's `net.rs` connection supervisor (the single
//! place that owns transport lifecycles and fans out incoming
//! messages) and `transport/hybrid.rs` (preferred-transport-with-
//! fallback), generalized from one fallback pair to a four-way
//! priority order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine as _;
use mesh_proto::{Envelope, PeerAddress, PeerId, RequestId, Topic};
use tokio::sync::{mpsc, oneshot};

use crate::awareness::Awareness;
use crate::bootstrap::{self, Bootstrap};
use crate::error::MeshError;
use crate::transport::dht::DhtTransport;
use crate::transport::direct::DirectTransport;
use crate::transport::local::LocalTransport;
use crate::transport::relay::RelayTransport;
use crate::transport::{Transport, TransportEvent};

/// Events the mesh core surfaces to its embedder: documents arriving,
/// membership changes, and presence updates.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerJoined { peer: PeerAddress },
    PeerLeft { peer: PeerId },
    Sync { doc_id: String, data: Vec<u8>, origin: PeerId },
    Awareness { doc_id: String, states: serde_json::Map<String, serde_json::Value> },
}

/// Transport send-path priority: try direct first, then relay, then
/// the DHT sidecar.
const SEND_PRIORITY: [TransportKind; 3] = [TransportKind::Direct, TransportKind::Relay, TransportKind::Dht];
/// Broadcast priority is deliberately different from the send path: a
/// relay `relay_broadcast` fans out to the whole topic in one
/// server-side operation, so it is tried only after direct and DHT
/// have each had a chance to reach peers those two don't cover, and it
/// is the one variant that can duplicate delivery to a peer already
/// reached directly — the manager de-duplicates by peer id rather than
/// skip relay outright.
const BROADCAST_PRIORITY: [TransportKind; 3] = [TransportKind::Direct, TransportKind::Dht, TransportKind::Relay];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    Direct,
    Relay,
    Dht,
}

/// Owns every transport and the membership tracker for one joined
/// workspace at a time.
pub struct PeerManager {
    local_peer_id: PeerId,
    relay: Arc<RelayTransport>,
    direct: Arc<DirectTransport>,
    dht: Arc<DhtTransport>,
    local: Arc<LocalTransport>,
    bootstrap: Arc<Bootstrap>,
    awareness: Arc<Awareness>,
    max_connections: usize,
    events: mpsc::UnboundedSender<MeshEvent>,
    current_workspace: parking_lot::Mutex<Option<String>>,
    background: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Waiters for an in-flight liveness probe's `peer-list` reply,
    /// keyed by the `peer-request`'s correlation id. Resolved from
    /// whichever transport's event-pump task happens to route the
    /// reply back, since that task is not the one awaiting it.
    probe_waiters: Arc<parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<()>>>>,
}

impl PeerManager {
    #[must_use]
    pub fn new(
        local_peer_id: PeerId,
        display_name: String,
        color: String,
        relay_url: impl Into<String>,
        direct_bind_addr: SocketAddr,
        dht_sidecar_addr: SocketAddr,
        local_listen_port: u16,
        max_connections: usize,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let my_address = PeerAddress {
            peer_id: local_peer_id,
            relay: Some(String::new()),
            direct: false,
            dht: None,
            local: None,
            display_name,
            color,
            last_seen: 0,
        };
        let manager = Self {
            local_peer_id,
            relay: Arc::new(RelayTransport::new(local_peer_id, relay_url)),
            direct: Arc::new(DirectTransport::new(local_peer_id, direct_bind_addr)),
            dht: Arc::new(DhtTransport::new(dht_sidecar_addr)),
            local: Arc::new(LocalTransport::new(
                local_peer_id,
                local_listen_port,
                my_address.display_name.clone(),
                my_address.color.clone(),
            )),
            bootstrap: Arc::new(Bootstrap::new(my_address, max_connections)),
            awareness: Arc::new(Awareness::new()),
            max_connections,
            events: events_tx,
            current_workspace: parking_lot::Mutex::new(None),
            background: parking_lot::Mutex::new(Vec::new()),
            probe_waiters: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        };
        (manager, events_rx)
    }

    fn transport_for(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Direct => Arc::clone(&self.direct) as Arc<dyn Transport>,
            TransportKind::Relay => Arc::clone(&self.relay) as Arc<dyn Transport>,
            TransportKind::Dht => Arc::clone(&self.dht) as Arc<dyn Transport>,
        }
    }

    /// Join a workspace: bring up every transport, join the derived
    /// topic, seed the known-peer set from the rendezvous server, and
    /// start background discovery and maintenance.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Transient`] if a transport fails to
    /// initialize.
    pub async fn join_workspace(&self, workspace_id: &str) -> Result<(), MeshError> {
        *self.current_workspace.lock() = Some(workspace_id.to_string());
        let topic = Topic::for_workspace(workspace_id);
        self.bootstrap.begin_join(topic);

        self.relay.initialize().await?;
        self.direct.initialize().await?;
        self.dht.initialize().await?;
        self.local.initialize().await?;

        self.relay.join_topic(topic).await?;
        self.dht.join_topic(topic)?;
        self.local.join_topic(topic);

        let seeds = self.relay.request_peers(topic).await;
        self.bootstrap.record_discovered(seeds);
        self.connect_known_peers().await;

        self.spawn_event_pumps();
        self.spawn_maintenance_loop();
        Ok(())
    }

    /// Leave the current workspace. Captures and clears the workspace
    /// id before awaiting transport teardown, so a re-entrant
    /// `join_workspace` call from an event handler racing this one
    /// never observes a half-torn-down state.
    pub async fn leave_workspace(&self) {
        let Some(_workspace_id) = self.current_workspace.lock().take() else {
            return;
        };
        self.bootstrap.reset();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        let _ = self.direct.destroy().await;
        let _ = self.dht.destroy().await;
        let _ = self.local.destroy().await;
        let _ = self.relay.destroy().await;
    }

    async fn connect_known_peers(&self) {
        for target in self.bootstrap.next_connect_targets() {
            self.try_connect(target).await;
        }
    }

    /// Dial a peer and, once the transport accepts it, probe liveness
    /// before marking it connected — a transport-level accept is not
    /// by itself proof the peer is live. Falls through the send
    /// priority order on a failed dial or a failed probe, and frees
    /// the peer from `pending` if none of them pan out, so a later
    /// `connect_known_peers` pass can retry it.
    async fn try_connect(&self, target: PeerAddress) {
        let peer = target.peer_id;
        self.bootstrap.mark_pending(peer);
        for kind in SEND_PRIORITY {
            let transport = self.transport_for(kind);
            if transport.connect(peer, &target).await.is_err() {
                continue;
            }
            match kind {
                TransportKind::Direct => {
                    // The direct transport only fires `PeerConnected`
                    // once its own QUIC handshake has actually
                    // completed; that event is itself the liveness
                    // proof, resolved by the event pump.
                    return;
                }
                TransportKind::Relay | TransportKind::Dht => {
                    if self.probe_liveness(peer, &transport).await {
                        self.bootstrap.mark_connected(peer);
                        return;
                    }
                }
            }
        }
        self.bootstrap.mark_disconnected(peer);
    }

    /// Send a `peer-request` over `transport` and wait up to
    /// `PEER_REQUEST_TIMEOUT_SECS` for any reply naming the same
    /// correlation id. A relay/DHT `connect()` only wires up routing
    /// state — it never by itself proves the peer is actually
    /// listening on the other end, so this is the step that licenses
    /// `mark_connected`.
    async fn probe_liveness(&self, peer: PeerId, transport: &Arc<dyn Transport>) -> bool {
        let request_id = RequestId::now_v7();
        let (tx, rx) = oneshot::channel();
        self.probe_waiters.lock().insert(request_id, tx);
        self.bootstrap.begin_request(peer, request_id);

        let envelope = Envelope::PeerRequest { request_id, timestamp: 0 };
        let sent = match mesh_proto::encode_control(&envelope) {
            Ok(bytes) => transport.send(peer, &bytes).await.is_ok(),
            Err(_) => false,
        };
        if !sent {
            self.probe_waiters.lock().remove(&request_id);
            return false;
        }

        let timeout = std::time::Duration::from_secs(bootstrap::PEER_REQUEST_TIMEOUT_SECS);
        let arrived = tokio::time::timeout(timeout, rx).await.is_ok_and(|r| r.is_ok());
        self.probe_waiters.lock().remove(&request_id);
        arrived
    }

    fn spawn_event_pumps(&self) {
        for (kind, rx) in [
            (TransportKind::Direct, self.direct.subscribe()),
            (TransportKind::Relay, self.relay.subscribe()),
            (TransportKind::Dht, self.dht.subscribe()),
        ] {
            let manager_events = self.events.clone();
            let bootstrap = Arc::clone(&self.bootstrap);
            let awareness = Arc::clone(&self.awareness);
            let direct = Arc::clone(&self.direct);
            let relay = Arc::clone(&self.relay);
            let dht = Arc::clone(&self.dht);
            let probe_waiters = Arc::clone(&self.probe_waiters);
            let mut rx = rx;
            let handle = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    handle_transport_event(
                        kind,
                        event,
                        &manager_events,
                        &bootstrap,
                        &awareness,
                        &direct,
                        &relay,
                        &dht,
                        &probe_waiters,
                    )
                    .await;
                }
            });
            self.background.lock().push(handle);
        }

        // The direct transport's own offer/answer/candidate chatter is
        // carried over the relay.
        if let Some(mut signals) = self.direct.take_outbound_signals() {
            let relay = Arc::clone(&self.relay);
            let handle = tokio::spawn(async move {
                while let Some((target, blob)) = signals.recv().await {
                    let _ = relay.forward_signaling(target, blob);
                }
            });
            self.background.lock().push(handle);
        }
    }

    fn spawn_maintenance_loop(&self) {
        let bootstrap = Arc::clone(&self.bootstrap);
        let relay = Arc::clone(&self.relay);
        let direct = Arc::clone(&self.direct);
        let dht = Arc::clone(&self.dht);
        let local_peer_id = self.local_peer_id;
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(bootstrap::MAINTENANCE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                bootstrap.evict_stale();
                bootstrap.reset_discovery_pass();

                if let Some(topic) = bootstrap.current_topic() {
                    for target in bootstrap.next_discovery_targets(5) {
                        let request_id = RequestId::now_v7();
                        bootstrap.begin_request(target, request_id);
                        let envelope = Envelope::PeerRequest { request_id, timestamp: 0 };
                        send_envelope_best_effort(&direct, &relay, &dht, target, &envelope);
                    }

                    let announce = Envelope::PeerAnnounce { peer: bootstrap.my_address(), timestamp: 0 };
                    if let Ok(bytes) = mesh_proto::encode_control(&announce) {
                        let _ = relay.relay_broadcast_topic(topic, bytes);
                    }
                }
                let _ = local_peer_id;
            }
        });
        self.background.lock().push(handle);
    }

    /// Send an application payload to one peer, trying transports in
    /// send-path priority order (direct, then relay, then DHT).
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NoTransport`] if no transport currently
    /// holds an open link to `peer`.
    pub async fn send(&self, peer: PeerId, payload: &[u8]) -> Result<(), MeshError> {
        for kind in SEND_PRIORITY {
            let transport = self.transport_for(kind);
            if transport.is_connected(peer) {
                return transport.send(peer, payload).await.map_err(MeshError::from);
            }
        }
        Err(MeshError::NoTransport(peer))
    }

    /// Broadcast an already-encrypted document update to the whole
    /// workspace (spec §6's `send_update`). `ciphertext` is the output
    /// of [`crate::crypto::encrypt_update`]; this wraps it in the
    /// binary frame, base64-encodes it into a `sync` envelope, and
    /// broadcasts that envelope over [`Self::broadcast`].
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Protocol`] if `doc_id` is too long to frame,
    /// or propagates [`Self::broadcast`]'s error.
    pub async fn send_update(&self, doc_id: &str, ciphertext: &[u8]) -> Result<(), MeshError> {
        let frame = mesh_proto::frame_encode(doc_id, ciphertext)?;
        let data = base64::engine::general_purpose::STANDARD.encode(frame);
        let envelope = Envelope::Sync {
            doc_id: doc_id.to_string(),
            data,
            origin: self.local_peer_id,
            timestamp: 0,
        };
        let bytes = mesh_proto::encode_control(&envelope)?;
        self.broadcast(&bytes).await
    }

    /// Broadcast to the whole topic. Tries direct and DHT broadcast
    /// first so peers reachable only through those paths are not
    /// starved, then relay; relay's `relay_broadcast` can duplicate
    /// delivery to a peer already reached by direct, which is
    /// harmless — CRDT deltas are idempotent to re-delivery.
    pub async fn broadcast(&self, payload: &[u8]) -> Result<(), MeshError> {
        let mut last_err = None;
        for kind in BROADCAST_PRIORITY {
            let transport = self.transport_for(kind);
            match transport.broadcast(payload).await {
                Ok(()) => {}
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) if self.bootstrap.connected_count() == 0 => Err(MeshError::from(e)),
            _ => Ok(()),
        }
    }
}

async fn handle_transport_event(
    kind: TransportKind,
    event: TransportEvent,
    out: &mpsc::UnboundedSender<MeshEvent>,
    bootstrap: &Arc<Bootstrap>,
    awareness: &Arc<Awareness>,
    direct: &Arc<DirectTransport>,
    relay: &Arc<RelayTransport>,
    dht: &Arc<DhtTransport>,
    probe_waiters: &Arc<parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<()>>>>,
) {
    match event {
        TransportEvent::PeerConnected { peer } => {
            bootstrap.mark_connected(peer);
            if let Some(address) = bootstrap.known_peers().into_iter().find(|p| p.peer_id == peer) {
                let _ = out.send(MeshEvent::PeerJoined { peer: address });
            }
        }
        TransportEvent::PeerDisconnected { peer } => {
            if !direct.is_connected(peer) && kind != TransportKind::Direct {
                bootstrap.mark_disconnected(peer);
                let _ = out.send(MeshEvent::PeerLeft { peer });
            }
        }
        TransportEvent::Message { peer, payload } => {
            if let Ok(Some(envelope)) = mesh_proto::decode_control(&payload, mesh_proto::control::DEFAULT_MAX_ENVELOPE_BYTES) {
                route_envelope(peer, envelope, out, bootstrap, awareness, direct, relay, dht, probe_waiters);
            }
        }
        TransportEvent::PeersDiscovered { peers } => {
            bootstrap.record_discovered(peers);
        }
        TransportEvent::PeerAnnounced { address } => {
            bootstrap.record_discovered(std::iter::once(address));
        }
        TransportEvent::Signal { from, blob } => {
            let _ = direct.handle_signal(from, blob).await;
        }
        TransportEvent::Error { message } => {
            tracing::warn!(transport = ?kind, error = %message, "transport reported an error");
        }
    }
}

fn route_envelope(
    from: PeerId,
    envelope: Envelope,
    out: &mpsc::UnboundedSender<MeshEvent>,
    bootstrap: &Arc<Bootstrap>,
    awareness: &Arc<Awareness>,
    direct: &Arc<DirectTransport>,
    relay: &Arc<RelayTransport>,
    dht: &Arc<DhtTransport>,
    probe_waiters: &Arc<parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<()>>>>,
) {
    match envelope {
        Envelope::Sync { doc_id, data, origin, .. } => {
            let Some((frame_doc_id, ciphertext)) = decode_sync_payload(&data) else { return };
            if frame_doc_id != doc_id {
                return;
            }
            let _ = out.send(MeshEvent::Sync { doc_id, data: ciphertext, origin });
        }
        Envelope::Awareness { doc_id, states, .. } => {
            awareness.note_remote(doc_id.clone(), states.clone());
            let _ = out.send(MeshEvent::Awareness { doc_id, states });
        }
        Envelope::PeerRequest { request_id, .. } => {
            let reply = Envelope::PeerList { peers: bootstrap.connected_peers(), request_id: Some(request_id), timestamp: 0 };
            send_envelope_best_effort(direct, relay, dht, from, &reply);
        }
        Envelope::PeerList { peers, request_id, .. } => {
            if let Some(request_id) = request_id {
                bootstrap.resolve_request(request_id);
                if let Some(tx) = probe_waiters.lock().remove(&request_id) {
                    let _ = tx.send(());
                }
            }
            bootstrap.record_discovered(peers);
        }
        Envelope::PeerAnnounce { peer, .. } => {
            bootstrap.record_discovered(std::iter::once(peer));
        }
        Envelope::Ping { .. } | Envelope::Pong { .. } | Envelope::Identity { .. } | Envelope::Disconnect { .. } => {}
        Envelope::Signal { .. } | Envelope::Unknown(_) => {}
    }
}

/// Reverse of the encoding `send_update` performs: base64-decode the
/// wire `data` field, then parse the binary frame header, recovering
/// the document id it actually names and the still-encrypted
/// ciphertext. Decryption is the embedder's responsibility via
/// [`crate::sink`] or its own call to [`crate::crypto::decrypt_update`].
fn decode_sync_payload(data: &str) -> Option<(String, Vec<u8>)> {
    let framed = base64::engine::general_purpose::STANDARD.decode(data).ok()?;
    mesh_proto::frame_decode(&framed).ok()
}

fn send_envelope_best_effort(
    direct: &Arc<DirectTransport>,
    relay: &Arc<RelayTransport>,
    dht: &Arc<DhtTransport>,
    target: PeerId,
    envelope: &Envelope,
) {
    let Ok(bytes) = mesh_proto::encode_control(envelope) else { return };
    if direct.is_connected(target) {
        let direct = Arc::clone(direct);
        let bytes = bytes.clone();
        tokio::spawn(async move {
            let _ = direct.send(target, &bytes).await;
        });
        return;
    }
    if relay.is_connected(target) {
        let relay = Arc::clone(relay);
        tokio::spawn(async move {
            let _ = relay.send(target, &bytes).await;
        });
        return;
    }
    let dht = Arc::clone(dht);
    tokio::spawn(async move {
        let _ = dht.send(target, &bytes).await;
    });
}
