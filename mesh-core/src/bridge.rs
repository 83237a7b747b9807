//! Wires [`DocSink`] instances to a [`PeerManager`], completing the
//! "CRDT-facing byte pipe" of spec §6: an embedder opens a document,
//! writes and reads plaintext through the sink's own event stream, and
//! never sees a transport, a topic, or an envelope.
//!
//! Grounded the same way the teacher's `net.rs` bridges a UI event loop
//! to its transport stack: one coordinator owns the inbound event pump
//! and holds per-entity state (there, per-conversation; here, per-
//! document) keyed by id.

use std::collections::HashMap;
use std::sync::Arc;

use mesh_proto::frame_encode;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::crypto::WorkspaceKey;
use crate::error::MeshError;
use crate::peer_manager::{MeshEvent, PeerManager};
use crate::sink::{DocSink, SinkEvent};

/// Routes outbound [`DocSink`] writes to the network and inbound `sync`
/// events back to the right sink, by document id.
pub struct DocRouter {
    manager: Arc<PeerManager>,
    sinks: Mutex<HashMap<String, Arc<DocSink>>>,
}

impl DocRouter {
    /// Take ownership of a [`PeerManager`]'s event stream and start
    /// routing. Events for documents with no open sink (`PeerJoined`,
    /// `PeerLeft`, `Awareness`, and any `Sync` for a doc id nobody has
    /// opened yet) are forwarded unchanged on the returned receiver.
    #[must_use]
    pub fn spawn(manager: Arc<PeerManager>, mut mesh_events: mpsc::UnboundedReceiver<MeshEvent>) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent>) {
        let router = Arc::new(Self { manager, sinks: Mutex::new(HashMap::new()) });
        let (passthrough_tx, passthrough_rx) = mpsc::unbounded_channel();

        let routed = Arc::clone(&router);
        tokio::spawn(async move {
            while let Some(event) = mesh_events.recv().await {
                match event {
                    MeshEvent::Sync { doc_id, data, origin } => {
                        let sink = routed.sinks.lock().get(&doc_id).cloned();
                        match sink {
                            Some(sink) => {
                                if let Ok(frame) = frame_encode(&doc_id, &data) {
                                    let _ = sink.recv(&frame);
                                }
                            }
                            None => {
                                let _ = passthrough_tx.send(MeshEvent::Sync { doc_id, data, origin });
                            }
                        }
                    }
                    other => {
                        let _ = passthrough_tx.send(other);
                    }
                }
            }
        });

        (router, passthrough_rx)
    }

    /// Open a document: registers a sink under `doc_id` and flushes any
    /// writes queued before this call onto the network.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError`] if a queued write fails to broadcast.
    pub async fn open_document(&self, doc_id: impl Into<String>, key: WorkspaceKey) -> Result<mpsc::UnboundedReceiver<SinkEvent>, MeshError> {
        let doc_id = doc_id.into();
        let (sink, rx) = DocSink::new(doc_id.clone(), key);
        let sink = Arc::new(sink);
        self.sinks.lock().insert(doc_id.clone(), Arc::clone(&sink));

        let flushed = sink.open().map_err(|e| MeshError::InvalidInput(e.to_string()))?;
        for frame in flushed {
            self.publish_frame(&doc_id, &frame).await?;
        }
        Ok(rx)
    }

    /// Encrypt, frame, and broadcast `plaintext` for an already-open
    /// document.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidInput`] if the sink is closed or the
    /// doc id was never opened; otherwise propagates the underlying
    /// broadcast error.
    pub async fn send(&self, doc_id: &str, plaintext: &[u8]) -> Result<(), MeshError> {
        let sink = self.sinks.lock().get(doc_id).cloned().ok_or_else(|| MeshError::InvalidInput(format!("document {doc_id:?} is not open")))?;
        let frame = sink.send(plaintext).map_err(|e| MeshError::InvalidInput(e.to_string()))?;
        match frame {
            Some(frame) => self.publish_frame(doc_id, &frame).await,
            None => Ok(()), // queued: the sink isn't actually open yet
        }
    }

    /// Close a document's sink and stop routing inbound sync events to it.
    pub fn close_document(&self, doc_id: &str) {
        if let Some(sink) = self.sinks.lock().remove(doc_id) {
            sink.close();
        }
    }

    async fn publish_frame(&self, doc_id: &str, frame: &[u8]) -> Result<(), MeshError> {
        let (frame_doc_id, ciphertext) = mesh_proto::frame_decode(frame)?;
        debug_assert_eq!(frame_doc_id, doc_id, "sink produced a frame for the wrong document");
        self.manager.send_update(doc_id, &ciphertext).await
    }
}
