//! Rendezvous/relay server core: connection registry, topic membership,
//! and the op-by-op handling of [`ClientOp`].
//!
//! Each accepted WebSocket carries exactly one peer's session. The first
//! message must be [`ClientOp::Identify`]; anything else closes the
//! connection. After that the peer may join/leave topics, request the
//! membership of a topic, forward signaling blobs, and relay frames
//! unicast or broadcast to a topic. The server never inspects frame
//! contents — `frame` is an opaque `Vec<u8>` end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use mesh_proto::rendezvous::{ClientOp, ServerOp};
use mesh_proto::{PeerAddress, PeerId};
use tokio::sync::{RwLock, mpsc};

use crate::ratelimit::RateLimiter;
use crate::topics::TopicRegistry;

/// Shared state for the whole server: every connected peer's outbound
/// channel plus topic membership.
pub struct RelayState {
    connections: RwLock<HashMap<PeerId, mpsc::UnboundedSender<ServerOp>>>,
    topics: TopicRegistry,
    rate_per_sec: u32,
    burst: u32,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rate_limit(crate::ratelimit::DEFAULT_RATE_PER_SEC, crate::ratelimit::DEFAULT_BURST)
    }

    #[must_use]
    pub fn with_rate_limit(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            topics: TopicRegistry::new(),
            rate_per_sec,
            burst,
        }
    }

    async fn register(&self, peer: PeerId, sender: mpsc::UnboundedSender<ServerOp>) {
        self.connections.write().await.insert(peer, sender);
    }

    async fn unregister(&self, peer: PeerId) {
        self.connections.write().await.remove(&peer);
    }

    async fn sender_for(&self, peer: PeerId) -> Option<mpsc::UnboundedSender<ServerOp>> {
        self.connections.read().await.get(&peer).cloned()
    }

    async fn send_to(&self, peer: PeerId, op: ServerOp) {
        if let Some(sender) = self.sender_for(peer).await {
            let _ = sender.send(op);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Handles one accepted WebSocket end to end: identify, op loop, cleanup.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(peer_id) = wait_for_identify(&mut ws_receiver).await else {
        tracing::debug!("connection closed before identify");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerOp>();
    state.register(peer_id, tx).await;
    state.send_to(peer_id, ServerOp::Identified { peer_id }).await;
    tracing::info!(%peer_id, "peer identified");

    let writer_peer = peer_id;
    let mut write_task = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&op) else { continue };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                tracing::debug!(peer_id = %writer_peer, "write failed, closing");
                break;
            }
        }
    });

    let mut limiter = RateLimiter::new(state.rate_per_sec, state.burst);
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let Message::Text(text) = msg else {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
                continue;
            };

            if let Err(retry_after) = limiter.check() {
                reader_state
                    .send_to(
                        peer_id,
                        ServerOp::RateLimited {
                            retry_after_secs: retry_after.as_secs(),
                        },
                    )
                    .await;
                continue;
            }

            match serde_json::from_str::<ClientOp>(&text) {
                Ok(op) => handle_op(peer_id, op, &reader_state).await,
                Err(e) => {
                    reader_state
                        .send_to(peer_id, ServerOp::Error { message: format!("malformed op: {e}") })
                        .await;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(peer_id).await;
    state.topics.leave_all(peer_id).await;
    tracing::info!(%peer_id, "peer disconnected");
}

async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<PeerId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientOp>(&text) {
                Ok(ClientOp::Identify { peer_id }) => return Some(peer_id),
                Ok(_) => return None,
                Err(_) => return None,
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn handle_op(peer_id: PeerId, op: ClientOp, state: &Arc<RelayState>) {
    match op {
        ClientOp::Identify { .. } => {
            state
                .send_to(peer_id, ServerOp::Error { message: "already identified".to_string() })
                .await;
        }
        ClientOp::JoinTopic { topic } => {
            state.topics.join(peer_id, topic).await;
            state.send_to(peer_id, ServerOp::Joined { topic }).await;
        }
        ClientOp::LeaveTopic { topic } => {
            state.topics.leave(peer_id, topic).await;
            state.send_to(peer_id, ServerOp::Left { topic }).await;
        }
        ClientOp::RequestPeers { topic } => {
            let members = state.topics.members_excluding(topic, peer_id).await;
            let peers = members
                .into_iter()
                .map(|id| PeerAddress {
                    peer_id: id,
                    relay: Some(String::new()),
                    direct: false,
                    dht: None,
                    local: None,
                    display_name: String::new(),
                    color: String::new(),
                    last_seen: now_millis(),
                })
                .collect();
            state.send_to(peer_id, ServerOp::PeerList { topic, peers }).await;
        }
        ClientOp::ForwardSignaling { target, blob } => {
            state.send_to(target, ServerOp::Signal { from: peer_id, blob }).await;
        }
        ClientOp::RelayUnicast { target, frame } => {
            state.send_to(target, ServerOp::Inbound { origin: peer_id, frame }).await;
        }
        ClientOp::RelayBroadcast { topic, frame } => {
            let members = state.topics.members_excluding(topic, peer_id).await;
            for target in members {
                state
                    .send_to(target, ServerOp::Inbound { origin: peer_id, frame: frame.clone() })
                    .await;
            }
        }
        ClientOp::Ping { timestamp } => {
            state.send_to(peer_id, ServerOp::Pong { ping_timestamp: timestamp }).await;
        }
    }
}

/// Starts the server on `addr`, returning the bound address and a join
/// handle. The primary entry point for both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind `addr`.
pub async fn start_server(
    addr: &str,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind `addr`.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let app = axum::Router::new().route("/ws", axum::routing::get(ws_handler)).with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

#[cfg(test)]
pub async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0").await.expect("failed to start test server")
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
