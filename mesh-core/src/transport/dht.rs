//! DHT transport: a client to a host-provided swarm process reached
//! over a local control channel. The mesh core never
//! speaks the DHT wire protocol itself — it joins/leaves topics and
//! sends/receives frames by proxy through the sidecar.
//!
//! Grounded on the relay transport's client/writer-task split, modeled
//! here as a length-prefixed JSON control socket instead of a
//! WebSocket, since the sidecar is a local process rather than a
//! remote server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use mesh_proto::{PeerAddress, PeerId, Topic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{BoxFuture, LinkState, Transport, TransportError, TransportEvent};

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Operations sent to the host sidecar over the local control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
enum HostOp {
    JoinTopic { topic: Topic },
    LeaveTopic { topic: Topic },
    Send { target: PeerId, frame: Vec<u8> },
    Broadcast { topic: Topic, frame: Vec<u8> },
}

/// Events the host sidecar pushes back over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum HostEvent {
    Joined { topic: Topic },
    PeersDiscovered { peers: Vec<PeerAddress> },
    /// The host reports a peer as already fully open at the swarm
    /// level. Registration on this event must be idempotent and must
    /// never override a connection type already set by another
    /// transport.
    PeerOpen { peer: PeerId },
    Inbound { origin: PeerId, frame: Vec<u8> },
    Error { message: String },
}

struct Shared {
    joined_topics: Mutex<Vec<Topic>>,
    peer_state: Mutex<HashMap<PeerId, LinkState>>,
    reconnect_attempts: AtomicU32,
}

/// DHT transport: talks to a host sidecar over `sidecar_addr`.
pub struct DhtTransport {
    sidecar_addr: SocketAddr,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<HostOp>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<HostOp>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DhtTransport {
    /// Build a DHT transport that connects to a host sidecar listening
    /// at `sidecar_addr`.
    #[must_use]
    pub fn new(sidecar_addr: SocketAddr) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            sidecar_addr,
            shared: Arc::new(Shared {
                joined_topics: Mutex::new(Vec::new()),
                peer_state: Mutex::new(HashMap::new()),
                reconnect_attempts: AtomicU32::new(0),
            }),
            outbound: outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            supervisor: Mutex::new(None),
        }
    }

    /// Join a DHT topic; rejoined automatically on host reconnect.
    pub fn join_topic(&self, topic: Topic) -> Result<(), TransportError> {
        let mut topics = self.shared.joined_topics.lock();
        if !topics.contains(&topic) {
            topics.push(topic);
        }
        drop(topics);
        self.outbound
            .send(HostOp::JoinTopic { topic })
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Leave a DHT topic.
    pub fn leave_topic(&self, topic: Topic) -> Result<(), TransportError> {
        self.shared.joined_topics.lock().retain(|t| *t != topic);
        self.outbound
            .send(HostOp::LeaveTopic { topic })
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn connect_once(
        sidecar_addr: SocketAddr,
        shared: &Arc<Shared>,
        outbound_rx: &mut mpsc::UnboundedReceiver<HostOp>,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), String> {
        let mut stream = TcpStream::connect(sidecar_addr).await.map_err(|e| e.to_string())?;

        for topic in shared.joined_topics.lock().clone() {
            write_frame(&mut stream, &HostOp::JoinTopic { topic }).await.map_err(|e| e.to_string())?;
        }

        shared.reconnect_attempts.store(0, Ordering::SeqCst);
        let (mut read_half, mut write_half) = stream.into_split();

        let writer = async {
            while let Some(op) = outbound_rx.recv().await {
                if write_frame(&mut write_half, &op).await.is_err() {
                    break;
                }
            }
        };

        let reader = async {
            loop {
                match read_frame::<HostEvent>(&mut read_half).await {
                    Ok(Some(event)) => handle_host_event(event, shared, event_tx),
                    _ => break,
                }
            }
        };

        tokio::select! {
            () = writer => {}
            () = reader => {}
        }

        Ok(())
    }

    async fn run_supervisor(
        sidecar_addr: SocketAddr,
        shared: Arc<Shared>,
        mut outbound_rx: mpsc::UnboundedReceiver<HostOp>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        loop {
            if let Err(message) = Self::connect_once(sidecar_addr, &shared, &mut outbound_rx, &event_tx).await {
                let _ = event_tx.send(TransportEvent::Error { message: message.clone() });
                tracing::warn!(error = %message, "DHT sidecar connection failed");
            }

            let disconnected: Vec<PeerId> = {
                let mut map = shared.peer_state.lock();
                let peers: Vec<PeerId> = map.keys().copied().collect();
                map.clear();
                peers
            };
            for peer in disconnected {
                let _ = event_tx.send(TransportEvent::PeerDisconnected { peer });
            }

            let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                tracing::error!("DHT transport exhausted reconnect attempts");
                return;
            }
            let delay = backoff_delay(attempt);
            tokio::time::sleep(delay).await;
        }
    }
}

/// `min(BACKOFF_BASE * 1.5^(attempt-1), BACKOFF_CAP)`.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = BACKOFF_BASE.as_secs_f64() * BACKOFF_MULTIPLIER.powi((attempt.saturating_sub(1)) as i32);
    Duration::from_secs_f64(secs.min(BACKOFF_CAP.as_secs_f64()))
}

fn handle_host_event(event: HostEvent, shared: &Arc<Shared>, event_tx: &mpsc::UnboundedSender<TransportEvent>) {
    match event {
        HostEvent::Joined { .. } => {}
        HostEvent::PeersDiscovered { peers } => {
            let _ = event_tx.send(TransportEvent::PeersDiscovered { peers });
        }
        HostEvent::PeerOpen { peer } => {
            // Idempotent: only the first notification for a given peer
            // fires `PeerConnected`; a repeat (or a peer already
            // connected via another transport's own bookkeeping, which
            // this transport cannot see) never re-fires it.
            let mut state = shared.peer_state.lock();
            if matches!(state.get(&peer), Some(LinkState::Open)) {
                return;
            }
            state.insert(peer, LinkState::Open);
            drop(state);
            let _ = event_tx.send(TransportEvent::PeerConnected { peer });
        }
        HostEvent::Inbound { origin, frame } => {
            let _ = event_tx.send(TransportEvent::Message { peer: origin, payload: frame });
        }
        HostEvent::Error { message } => {
            let _ = event_tx.send(TransportEvent::Error { message });
        }
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin, T: Serialize>(w: &mut W, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(value)?;
    w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    w.write_all(&bytes).await
}

async fn read_frame<T: for<'de> Deserialize<'de>>(
    r: &mut (impl AsyncReadExt + Unpin),
) -> std::io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    if r.read_exact(&mut len_buf).await.is_err() {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf).ok())
}

impl Transport for DhtTransport {
    fn initialize(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut guard = self.supervisor.lock();
            if guard.is_some() {
                return Ok(());
            }
            let outbound_rx = self.outbound_rx.lock().take().ok_or(TransportError::NotInitialized)?;
            let sidecar_addr = self.sidecar_addr;
            let shared = Arc::clone(&self.shared);
            let event_tx = self.event_tx.clone();
            let handle = tokio::spawn(Self::run_supervisor(sidecar_addr, shared, outbound_rx, event_tx));
            *guard = Some(handle);
            Ok(())
        })
    }

    fn connect<'a>(&'a self, peer: PeerId, address: &'a PeerAddress) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if address.dht.is_none() {
                return Err(TransportError::Unreachable(peer));
            }
            // The DHT swarm resolves reachability itself; the core only
            // learns about success via `HostEvent::PeerOpen`.
            Ok(())
        })
    }

    fn disconnect(&self, peer: PeerId) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.shared.peer_state.lock().remove(&peer).is_some() {
                let _ = self.event_tx.send(TransportEvent::PeerDisconnected { peer });
            }
            Ok(())
        })
    }

    fn send<'a>(&'a self, peer: PeerId, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.outbound
                .send(HostOp::Send { target: peer, frame: payload.to_vec() })
                .map_err(|e| TransportError::Io(e.to_string()))
        })
    }

    fn broadcast<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let Some(topic) = self.shared.joined_topics.lock().first().copied() else {
                return Err(TransportError::NotInitialized);
            };
            self.outbound
                .send(HostOp::Broadcast { topic, frame: payload.to_vec() })
                .map_err(|e| TransportError::Io(e.to_string()))
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
