//! Local-network transport: discovery only. Peers on the same subnet
//! announce themselves over UDP multicast; this transport never
//! carries application payloads itself, so `send`/`broadcast` return
//! `TransportError::NotSupported` and callers fall back to another
//! transport once a direct or relay link is established.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use mesh_proto::{PeerAddress, PeerId, Topic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 17, 42, 7);
const MULTICAST_PORT: u16 = 54827;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

use super::{BoxFuture, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Beacon {
    peer_id: PeerId,
    topic: Topic,
    port: u16,
    display_name: String,
    color: String,
}

struct Shared {
    local_peer_id: PeerId,
    topic: Mutex<Option<Topic>>,
    listen_port: u16,
    known: Mutex<HashMap<PeerId, PeerAddress>>,
}

/// UDP-multicast peer discovery for same-subnet workspaces.
pub struct LocalTransport {
    shared: Arc<Shared>,
    display_name: String,
    color: String,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl LocalTransport {
    /// Build a local-network transport. `listen_port` is advertised to
    /// peers as the port they should dial via whatever transport
    /// actually carries traffic (typically the direct transport).
    #[must_use]
    pub fn new(local_peer_id: PeerId, listen_port: u16, display_name: String, color: String) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                local_peer_id,
                topic: Mutex::new(None),
                listen_port,
                known: Mutex::new(HashMap::new()),
            }),
            display_name,
            color,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start advertising and listening for `topic`. Replaces any
    /// previously joined topic — the transport advertises one topic at
    /// a time.
    pub fn join_topic(&self, topic: Topic) {
        *self.shared.topic.lock() = Some(topic);
    }

    pub fn leave_topic(&self) {
        *self.shared.topic.lock() = None;
        self.shared.known.lock().clear();
    }

    async fn make_socket() -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)).await?;
        socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(false)?;
        Ok(socket)
    }

    async fn announce_loop(shared: Arc<Shared>, display_name: String, color: String) {
        let Ok(socket) = Self::make_socket().await else {
            tracing::warn!("local discovery: failed to bind multicast socket, discovery disabled");
            return;
        };
        let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT));
        let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
        loop {
            interval.tick().await;
            let Some(topic) = *shared.topic.lock() else { continue };
            let beacon = Beacon {
                peer_id: shared.local_peer_id,
                topic,
                port: shared.listen_port,
                display_name: display_name.clone(),
                color: color.clone(),
            };
            if let Ok(bytes) = serde_json::to_vec(&beacon) {
                let _ = socket.send_to(&bytes, dest).await;
            }
        }
    }

    async fn listen_loop(shared: Arc<Shared>, event_tx: mpsc::UnboundedSender<TransportEvent>) {
        let Ok(socket) = Self::make_socket().await else {
            return;
        };
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                continue;
            };
            let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..n]) else {
                continue;
            };
            if beacon.peer_id == shared.local_peer_id {
                continue;
            }
            let Some(joined) = *shared.topic.lock() else {
                continue;
            };
            if beacon.topic != joined {
                continue;
            }

            let local_addr = SocketAddr::new(from.ip(), beacon.port);
            let address = PeerAddress {
                peer_id: beacon.peer_id,
                relay: None,
                direct: false,
                dht: None,
                local: Some(local_addr),
                display_name: beacon.display_name,
                color: beacon.color,
                last_seen: current_unix_time(),
            };

            let is_new = {
                let mut known = shared.known.lock();
                let changed = known.get(&beacon.peer_id).map(|p| p.local) != Some(Some(local_addr));
                known.insert(beacon.peer_id, address.clone());
                changed
            };
            if is_new {
                let _ = event_tx.send(TransportEvent::PeersDiscovered { peers: vec![address] });
            }
        }
    }
}

fn current_unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Transport for LocalTransport {
    fn initialize(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock();
            if !tasks.is_empty() {
                return Ok(());
            }
            tasks.push(tokio::spawn(Self::announce_loop(
                Arc::clone(&self.shared),
                self.display_name.clone(),
                self.color.clone(),
            )));
            tasks.push(tokio::spawn(Self::listen_loop(Arc::clone(&self.shared), self.event_tx.clone())));
            Ok(())
        })
    }

    fn connect<'a>(&'a self, peer: PeerId, _address: &'a PeerAddress) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move { Err(TransportError::Unreachable(peer)) })
    }

    fn disconnect(&self, _peer: PeerId) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move { Ok(()) })
    }

    fn send<'a>(&'a self, _peer: PeerId, _payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move { Err(TransportError::NotSupported) })
    }

    fn broadcast<'a>(&'a self, _payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move { Err(TransportError::NotSupported) })
    }

    fn is_connected(&self, _peer: PeerId) -> bool {
        false
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        Vec::new()
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            self.shared.known.lock().clear();
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
