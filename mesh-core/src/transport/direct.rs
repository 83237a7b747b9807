//! Direct transport: one bidirectional, ordered, reliable
//! QUIC connection per peer, brought up through offer/answer signaling
//! carried over another transport (by default relay).
//!
//! Grounded on the teacher's `transport/quic.rs` (self-signed cert +
//! `SkipServerVerification`, since QUIC TLS here is transport
//! encryption only — peer authentication is out of scope per spec §1),
//! generalized from a single preconfigured dial into a signaling-driven
//! negotiation with glare resolution.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mesh_proto::{PeerAddress, PeerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{BoxFuture, LinkState, Transport, TransportError, TransportEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_INIT_MARKER: u8 = 0x01;

/// Offer/answer/candidate messages exchanged out-of-band,
/// carried as the `blob` of a relay `forward_signaling` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalBody {
    /// Propose a direct link. No address is needed in the offer itself
    /// — the offerer learns where to dial from the answer.
    Offer,
    /// Accept an offer, advertising the socket the answerer is
    /// listening on.
    Answer { addr: SocketAddr },
    /// An additional reachable address discovered after the initial
    /// offer/answer (e.g. a second network interface). Queued if it
    /// arrives before the negotiation has a remote description.
    Candidate { addr: SocketAddr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// We called `connect()`; we dial once we receive an `Answer`.
    Offering,
    /// We received an `Offer` we did not lose glare on; we wait to be
    /// dialed by the peer's accept loop.
    Answering,
}

struct Negotiation {
    role: Role,
    queued_candidates: Vec<SocketAddr>,
}

struct PeerLink {
    state: LinkState,
    connection: Option<quinn::Connection>,
}

struct Shared {
    negotiations: Mutex<HashMap<PeerId, Negotiation>>,
    links: Mutex<HashMap<PeerId, PeerLink>>,
}

/// QUIC-based direct transport. Owns a listening [`quinn::Endpoint`]
/// and dials out to peers once signaling resolves an address.
pub struct DirectTransport {
    local_peer_id: PeerId,
    bind_addr: SocketAddr,
    endpoint: Mutex<Option<quinn::Endpoint>>,
    shared: Arc<Shared>,
    /// Signals this transport wants sent to a peer via another
    /// transport (by default relay `forward_signaling`). The peer
    /// manager drains this and dispatches it.
    outbound_signals: Mutex<Option<mpsc::UnboundedReceiver<(PeerId, serde_json::Value)>>>,
    outbound_signals_tx: mpsc::UnboundedSender<(PeerId, serde_json::Value)>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DirectTransport {
    /// Build a direct transport that will bind to `bind_addr` on
    /// [`Transport::initialize`] (use `0.0.0.0:0` for an OS-assigned
    /// port).
    #[must_use]
    pub fn new(local_peer_id: PeerId, bind_addr: SocketAddr) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            local_peer_id,
            bind_addr,
            endpoint: Mutex::new(None),
            shared: Arc::new(Shared {
                negotiations: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
            }),
            outbound_signals: Mutex::new(Some(outbound_rx)),
            outbound_signals_tx: outbound_tx,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            accept_task: Mutex::new(None),
        }
    }

    /// Drain signals this transport wants delivered to peers. Intended
    /// to be wired by the peer manager to the relay transport's
    /// `forward_signaling`.
    #[must_use]
    pub fn take_outbound_signals(&self) -> Option<mpsc::UnboundedReceiver<(PeerId, serde_json::Value)>> {
        self.outbound_signals.lock().take()
    }

    /// The address this transport's QUIC endpoint is bound to, once
    /// initialized.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint
            .lock()
            .as_ref()
            .ok_or(TransportError::NotInitialized)?
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Handle a signaling blob received (by any means) from `from`.
    /// Implements spec §4.3.2's glare resolution: the peer with the
    /// lexicographically larger `PeerId` rolls back its own outgoing
    /// offer and accepts the remote one.
    pub async fn handle_signal(&self, from: PeerId, blob: serde_json::Value) -> Result<(), TransportError> {
        let body: SignalBody =
            serde_json::from_value(blob).map_err(|e| TransportError::Io(e.to_string()))?;

        match body {
            SignalBody::Offer => self.handle_offer(from).await,
            SignalBody::Answer { addr } => self.handle_answer(from, addr).await,
            SignalBody::Candidate { addr } => self.handle_candidate(from, addr).await,
        }
    }

    async fn handle_offer(&self, from: PeerId) -> Result<(), TransportError> {
        let glare = {
            let negotiations = self.shared.negotiations.lock();
            matches!(negotiations.get(&from), Some(n) if n.role == Role::Offering)
        };

        if glare && self.local_peer_id < from {
            // We are the smaller id: drop the incoming offer, keep our
            // own outgoing offer alive and wait for an answer to it.
            return Ok(());
        }

        // Either no glare, or we are the larger id and roll back our
        // own offer to accept the remote's instead.
        self.shared.negotiations.lock().insert(
            from,
            Negotiation { role: Role::Answering, queued_candidates: Vec::new() },
        );
        self.ensure_listener_running();
        let addr = self.local_addr()?;
        let _ = self
            .outbound_signals_tx
            .send((from, serde_json::to_value(SignalBody::Answer { addr }).unwrap_or_default()));
        Ok(())
    }

    async fn handle_answer(&self, from: PeerId, addr: SocketAddr) -> Result<(), TransportError> {
        let should_dial = {
            let negotiations = self.shared.negotiations.lock();
            matches!(negotiations.get(&from), Some(n) if n.role == Role::Offering)
        };
        if !should_dial {
            // We already rolled back this offer (lost glare on a later
            // offer) — a stale answer to the old offer is ignored.
            return Ok(());
        }
        self.dial(from, addr).await
    }

    async fn handle_candidate(&self, from: PeerId, addr: SocketAddr) -> Result<(), TransportError> {
        let mut negotiations = self.shared.negotiations.lock();
        match negotiations.get_mut(&from) {
            Some(n) if matches!(n.role, Role::Offering) => {
                // No remote description (answer) installed yet; queue it.
                n.queued_candidates.push(addr);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ensure_listener_running(&self) {
        let mut guard = self.accept_task.lock();
        if guard.is_some() {
            return;
        }
        let endpoint = self.endpoint.lock().clone();
        let Some(endpoint) = endpoint else { return };
        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        let local_id = self.local_peer_id;
        let handle = tokio::spawn(accept_loop(endpoint, shared, event_tx, local_id));
        *guard = Some(handle);
    }

    async fn dial(&self, peer: PeerId, addr: SocketAddr) -> Result<(), TransportError> {
        let endpoint = self
            .endpoint
            .lock()
            .clone()
            .ok_or(TransportError::NotInitialized)?;
        let client_config = make_client_config()?;
        let connecting = endpoint
            .connect_with(client_config, addr, "localhost")
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let connection = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let (mut send, _recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        send.write_all(&[STREAM_INIT_MARKER])
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        send.write_all(self.local_peer_id.as_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        self.shared.links.lock().insert(
            peer,
            PeerLink { state: LinkState::Open, connection: Some(connection.clone()) },
        );
        self.shared.negotiations.lock().remove(&peer);
        let _ = self.event_tx.send(TransportEvent::PeerConnected { peer });

        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        tokio::spawn(recv_loop(peer, connection, shared, event_tx));
        Ok(())
    }
}

async fn accept_loop(
    endpoint: quinn::Endpoint,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    _local_id: PeerId,
) {
    while let Some(incoming) = endpoint.accept().await {
        let shared = Arc::clone(&shared);
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "direct transport accept handshake failed");
                    return;
                }
            };
            let remote_addr = connection.remote_address();
            let Ok((_send, mut recv)) = connection.accept_bi().await else {
                return;
            };
            let mut marker = [0u8; 1];
            if recv.read_exact(&mut marker).await.is_err() || marker[0] != STREAM_INIT_MARKER {
                return;
            }
            let mut id_bytes = [0u8; 16];
            if recv.read_exact(&mut id_bytes).await.is_err() {
                return;
            }
            let peer = PeerId::from_bytes(id_bytes);

            tracing::debug!(%remote_addr, %peer, "direct transport accepted inbound connection");
            shared.negotiations.lock().remove(&peer);
            shared.links.lock().insert(
                peer,
                PeerLink { state: LinkState::Open, connection: Some(connection.clone()) },
            );
            let _ = event_tx.send(TransportEvent::PeerConnected { peer });
            recv_loop(peer, connection, shared, event_tx).await;
        });
    }
}

async fn recv_loop(
    peer: PeerId,
    connection: quinn::Connection,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        match connection.accept_bi().await {
            Ok((_send, mut recv)) => {
                let mut len_buf = [0u8; 4];
                if recv.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                if recv.read_exact(&mut buf).await.is_err() {
                    break;
                }
                let _ = event_tx.send(TransportEvent::Message { peer, payload: buf });
            }
            Err(_) => break,
        }
    }
    shared.links.lock().remove(&peer);
    let _ = event_tx.send(TransportEvent::PeerDisconnected { peer });
}

fn generate_self_signed_cert()
-> Result<(rustls::pki_types::CertificateDer<'static>, rustls::pki_types::PrivatePkcs8KeyDer<'static>), TransportError>
{
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| TransportError::Io(format!("certificate generation failed: {e}")))?;
    let cert_der = rustls::pki_types::CertificateDer::from(cert.cert);
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    Ok((cert_der, key_der))
}

fn make_server_config(
    cert_der: rustls::pki_types::CertificateDer<'static>,
    key_der: rustls::pki_types::PrivatePkcs8KeyDer<'static>,
) -> Result<quinn::ServerConfig, TransportError> {
    quinn::ServerConfig::with_single_cert(vec![cert_der], key_der.into())
        .map_err(|e| TransportError::Io(format!("QUIC server config error: {e}")))
}

fn make_client_config() -> Result<quinn::ClientConfig, TransportError> {
    let client_crypto = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Io(format!("TLS client config error: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    Ok(quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .map_err(|e| TransportError::Io(format!("QUIC client config error: {e}")))?,
    )))
}

/// Accepts any server certificate. QUIC TLS here provides transport
/// encryption only; peer authentication is an external collaborator
///.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

impl Transport for DirectTransport {
    fn initialize(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.endpoint.lock().is_some() {
                return Ok(());
            }
            let (cert_der, key_der) = generate_self_signed_cert()?;
            let server_config = make_server_config(cert_der, key_der)?;
            let endpoint = quinn::Endpoint::server(server_config, self.bind_addr)
                .map_err(|e| TransportError::Io(e.to_string()))?;
            *self.endpoint.lock() = Some(endpoint);
            self.ensure_listener_running();
            Ok(())
        })
    }

    fn connect<'a>(&'a self, peer: PeerId, address: &'a PeerAddress) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if !address.direct {
                return Err(TransportError::Unreachable(peer));
            }
            if self.is_connected(peer) {
                return Ok(());
            }
            self.shared.negotiations.lock().insert(
                peer,
                Negotiation { role: Role::Offering, queued_candidates: Vec::new() },
            );
            let _ = self
                .outbound_signals_tx
                .send((peer, serde_json::to_value(SignalBody::Offer).unwrap_or_default()));
            // `peer-connected` only fires once the answer arrives and
            // the dial succeeds; `connect` itself never
            // marks connected on its own.
            Ok(())
        })
    }

    fn disconnect(&self, peer: PeerId) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.shared.negotiations.lock().remove(&peer);
            if let Some(link) = self.shared.links.lock().remove(&peer) {
                if let Some(conn) = link.connection {
                    conn.close(0u32.into(), b"disconnect");
                }
                let _ = self.event_tx.send(TransportEvent::PeerDisconnected { peer });
            }
            Ok(())
        })
    }

    fn send<'a>(&'a self, peer: PeerId, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let connection = {
                let links = self.shared.links.lock();
                links.get(&peer).and_then(|l| l.connection.clone())
            };
            let connection = connection.ok_or(TransportError::Unreachable(peer))?;
            let (mut send, _recv) = connection
                .open_bi()
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            send.write_all(&(payload.len() as u32).to_be_bytes())
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            send.write_all(payload).await.map_err(|e| TransportError::Io(e.to_string()))?;
            send.finish().map_err(|e| TransportError::Io(e.to_string()))?;
            Ok(())
        })
    }

    fn broadcast<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let peers = self.connected_peers();
            for peer in peers {
                let _ = self.send(peer, payload).await;
            }
            Ok(())
        })
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        matches!(self.shared.links.lock().get(&peer), Some(l) if l.state == LinkState::Open)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared
            .links
            .lock()
            .iter()
            .filter(|(_, l)| l.state == LinkState::Open)
            .map(|(p, _)| *p)
            .collect()
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if let Some(handle) = self.accept_task.lock().take() {
                handle.abort();
            }
            if let Some(endpoint) = self.endpoint.lock().take() {
                endpoint.close(0u32.into(), b"shutdown");
            }
            self.shared.links.lock().clear();
            self.shared.negotiations.lock().clear();
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
