//! Relay transport: one long-lived WebSocket link to a
//! rendezvous server, speaking [`mesh_proto::rendezvous`]. Reconnects
//! with exponential backoff, rejoining the prior topic and resending
//! identity on every reconnect; sends a 30 s keepalive ping.
//!
//! Grounded on the teacher's `transport/relay.rs` client/writer-task
//! split and `net.rs`'s reconnect-supervisor pattern, generalized from
//! a single peer-to-peer pipe to the rendezvous join/request/forward/
//! unicast/broadcast operation set.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_proto::{ClientOp, PeerAddress, PeerId, ServerOp, Topic};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{BoxFuture, LinkState, Transport, TransportError, TransportEvent};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const REQUEST_PEERS_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared, lock-guarded state mutated only by the relay transport's own
/// background tasks (spec §5, "Per-peer maps in a transport are
/// mutated only by that transport's I/O task").
struct Shared {
    connected: AtomicBool,
    current_topic: Mutex<Option<Topic>>,
    peer_state: Mutex<std::collections::HashMap<PeerId, LinkState>>,
    pending_peer_list: Mutex<Option<(Topic, oneshot::Sender<Vec<PeerAddress>>)>>,
    rate_limited_until: Mutex<Option<std::time::Instant>>,
    reconnect_attempts: AtomicU32,
}

/// A relay transport client: one link to a rendezvous server, carrying
/// every peer this node currently treats as relay-reachable.
pub struct RelayTransport {
    local_peer_id: PeerId,
    relay_url: String,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ClientOp>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientOp>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayTransport {
    /// Build a relay transport bound to `relay_url`. Call
    /// [`Transport::initialize`] to bring up the connection.
    #[must_use]
    pub fn new(local_peer_id: PeerId, relay_url: impl Into<String>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            local_peer_id,
            relay_url: relay_url.into(),
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                current_topic: Mutex::new(None),
                peer_state: Mutex::new(std::collections::HashMap::new()),
                pending_peer_list: Mutex::new(None),
                rate_limited_until: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
            }),
            outbound: outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            supervisor: Mutex::new(None),
        }
    }

    /// Whether the WebSocket link to the rendezvous server is open.
    #[must_use]
    pub fn is_link_open(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Join a topic: rejoined automatically on every future reconnect
    /// until [`Self::leave_topic`] is called.
    pub async fn join_topic(&self, topic: Topic) -> Result<(), TransportError> {
        *self.shared.current_topic.lock() = Some(topic);
        self.send_op(ClientOp::JoinTopic { topic })
    }

    /// Leave the current topic.
    pub async fn leave_topic(&self, topic: Topic) -> Result<(), TransportError> {
        *self.shared.current_topic.lock() = None;
        self.send_op(ClientOp::LeaveTopic { topic })
    }

    /// Ask the server for the peers currently joined to `topic`.
    /// Resolves within [`REQUEST_PEERS_TIMEOUT`], or an empty list if
    /// the server never answers (spec §4.4: a missing reply is not an
    /// error).
    pub async fn request_peers(&self, topic: Topic) -> Vec<PeerAddress> {
        let (tx, rx) = oneshot::channel();
        *self.shared.pending_peer_list.lock() = Some((topic, tx));
        if self.send_op(ClientOp::RequestPeers { topic }).is_err() {
            return Vec::new();
        }
        tokio::time::timeout(REQUEST_PEERS_TIMEOUT, rx)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default()
    }

    /// Forward an opaque signaling blob to `target` via the server.
    pub fn forward_signaling(
        &self,
        target: PeerId,
        blob: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.send_op(ClientOp::ForwardSignaling { target, blob })
    }

    /// Send `frame` to every peer on `topic` in a single server-side
    /// broadcast (spec §4.3.1 `relay_broadcast`).
    pub fn relay_broadcast_topic(&self, topic: Topic, frame: Vec<u8>) -> Result<(), TransportError> {
        self.send_op(ClientOp::RelayBroadcast { topic, frame })
    }

    fn send_op(&self, op: ClientOp) -> Result<(), TransportError> {
        if let Some(until) = *self.shared.rate_limited_until.lock() {
            if std::time::Instant::now() < until {
                return Err(TransportError::Io("rate limited by rendezvous server".to_string()));
            }
        }
        self.outbound
            .send(op)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn connect_once(
        relay_url: &str,
        local_peer_id: PeerId,
        shared: &Arc<Shared>,
        outbound_rx: &mut mpsc::UnboundedReceiver<ClientOp>,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), String> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(relay_url)
            .await
            .map_err(|e| e.to_string())?;
        let (mut sink, mut stream) = ws_stream.split();

        let identify = ClientOp::Identify { peer_id: local_peer_id };
        send_json(&mut sink, &identify).await?;

        if let Some(topic) = *shared.current_topic.lock() {
            send_json(&mut sink, &ClientOp::JoinTopic { topic }).await?;
        }

        shared.connected.store(true, Ordering::SeqCst);
        shared.reconnect_attempts.store(0, Ordering::SeqCst);

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                op = outbound_rx.recv() => {
                    let Some(op) = op else { break; };
                    if send_json(&mut sink, &op).await.is_err() {
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    let ping = ClientOp::Ping { timestamp: now_ms() };
                    if send_json(&mut sink, &ping).await.is_err() {
                        break;
                    }
                }
                msg = stream.next() => {
                    let Some(Ok(msg)) = msg else { break; };
                    match msg {
                        WsMessage::Text(text) => {
                            if let Ok(op) = serde_json::from_str::<ServerOp>(&text) {
                                handle_server_op(op, shared, event_tx);
                            }
                        }
                        WsMessage::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run_supervisor(
        relay_url: String,
        local_peer_id: PeerId,
        shared: Arc<Shared>,
        mut outbound_rx: mpsc::UnboundedReceiver<ClientOp>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        loop {
            match Self::connect_once(&relay_url, local_peer_id, &shared, &mut outbound_rx, &event_tx).await {
                Ok(()) => {}
                Err(message) => {
                    let _ = event_tx.send(TransportEvent::Error { message: message.clone() });
                    tracing::warn!(error = %message, "relay transport connection failed");
                }
            }

            let disconnected_peers: Vec<PeerId> = {
                let mut map = shared.peer_state.lock();
                let peers: Vec<PeerId> = map.keys().copied().collect();
                map.clear();
                peers
            };
            for peer in disconnected_peers {
                let _ = event_tx.send(TransportEvent::PeerDisconnected { peer });
            }

            let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                tracing::error!("relay transport exhausted reconnect attempts");
                return;
            }
            let delay = std::cmp::min(BACKOFF_BASE * 2u32.saturating_pow(attempt - 1), BACKOFF_CAP);
            tokio::time::sleep(delay).await;
        }
    }
}

async fn send_json<S>(sink: &mut S, op: &ClientOp) -> Result<(), String>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(op).map_err(|e| e.to_string())?;
    sink.send(WsMessage::Text(text.into())).await.map_err(|e| e.to_string())
}

fn handle_server_op(op: ServerOp, shared: &Arc<Shared>, event_tx: &mpsc::UnboundedSender<TransportEvent>) {
    match op {
        ServerOp::Identified { .. } | ServerOp::Joined { .. } | ServerOp::Left { .. } | ServerOp::Pong { .. } => {}
        ServerOp::PeerList { topic, peers } => {
            let mut pending = shared.pending_peer_list.lock();
            if matches!(pending.as_ref(), Some((pending_topic, _)) if *pending_topic == topic) {
                if let Some((_, tx)) = pending.take() {
                    let _ = tx.send(peers.clone());
                }
            }
            drop(pending);
            let _ = event_tx.send(TransportEvent::PeersDiscovered { peers });
        }
        ServerOp::Signal { from, blob } => {
            let _ = event_tx.send(TransportEvent::Signal { from, blob });
        }
        ServerOp::Inbound { origin, frame } => {
            let mut state = shared.peer_state.lock();
            if !matches!(state.get(&origin), Some(LinkState::Open)) {
                state.insert(origin, LinkState::Open);
                drop(state);
                let _ = event_tx.send(TransportEvent::PeerConnected { peer: origin });
            }
            let _ = event_tx.send(TransportEvent::Message { peer: origin, payload: frame });
        }
        ServerOp::RateLimited { retry_after_secs } => {
            *shared.rate_limited_until.lock() =
                Some(std::time::Instant::now() + Duration::from_secs(retry_after_secs));
            let _ = event_tx.send(TransportEvent::Error {
                message: format!("rate limited for {retry_after_secs}s"),
            });
        }
        ServerOp::Error { message } => {
            let _ = event_tx.send(TransportEvent::Error { message });
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Transport for RelayTransport {
    fn initialize(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut guard = self.supervisor.lock();
            if guard.is_some() {
                return Ok(());
            }
            let outbound_rx = self
                .outbound_rx
                .lock()
                .take()
                .ok_or(TransportError::NotInitialized)?;
            let relay_url = self.relay_url.clone();
            let local_peer_id = self.local_peer_id;
            let shared = Arc::clone(&self.shared);
            let event_tx = self.event_tx.clone();
            let handle = tokio::spawn(Self::run_supervisor(relay_url, local_peer_id, shared, outbound_rx, event_tx));
            *guard = Some(handle);
            Ok(())
        })
    }

    fn connect<'a>(&'a self, peer: PeerId, address: &'a PeerAddress) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if address.relay.is_none() {
                return Err(TransportError::Unreachable(peer));
            }
            // Relay reachability is established by topic membership, not
            // per-peer dialing; a liveness probe (a `peer-request` sent
            // through `send`) is what actually proves the path works.
            Ok(())
        })
    }

    fn disconnect(&self, peer: PeerId) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let removed = self.shared.peer_state.lock().remove(&peer).is_some();
            if removed {
                let _ = self.event_tx.send(TransportEvent::PeerDisconnected { peer });
            }
            Ok(())
        })
    }

    fn send<'a>(&'a self, peer: PeerId, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.send_op(ClientOp::RelayUnicast {
                target: peer,
                frame: payload.to_vec(),
            })
        })
    }

    fn broadcast<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let Some(topic) = *self.shared.current_topic.lock() else {
                return Err(TransportError::NotInitialized);
            };
            self.send_op(ClientOp::RelayBroadcast {
                topic,
                frame: payload.to_vec(),
            })
        })
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        matches!(self.shared.peer_state.lock().get(&peer), Some(LinkState::Open))
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared
            .peer_state
            .lock()
            .iter()
            .filter(|(_, s)| matches!(s, LinkState::Open))
            .map(|(p, _)| *p)
            .collect()
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if let Some(handle) = self.supervisor.lock().take() {
                handle.abort();
            }
            self.shared.connected.store(false, Ordering::SeqCst);
            self.shared.peer_state.lock().clear();
            Ok(())
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.event_rx.lock().take().unwrap_or_else(|| {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        })
    }
}

/// Deduplicate a peer list by peer id, keeping the first occurrence.
#[must_use]
pub fn dedupe_peers(peers: &[PeerAddress]) -> Vec<PeerAddress> {
    let mut seen = HashSet::new();
    peers
        .iter()
        .filter(|p| seen.insert(p.peer_id))
        .cloned()
        .collect()
}
