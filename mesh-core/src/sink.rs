//! The CRDT-facing byte pipe: the boundary between an opaque CRDT
//! library (which only ever sees plaintext update bytes) and the
//! framed, encrypted wire format the mesh actually carries. One
//! [`DocSink`] per open document.

use mesh_proto::{frame_decode, frame_encode, FrameError};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::crypto::{decrypt_update, encrypt_update, CryptoError, WorkspaceKey};

/// Events a [`DocSink`] emits over its lifetime, in this order:
/// exactly one `Open`, any number of `Message`/`Error`, then at most
/// one `Closed`.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Open,
    Message(Vec<u8>),
    Closed,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink for document {0:?} is closed")]
    Closed(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Open,
    Closed,
}

struct Inner {
    state: State,
    queued: Vec<Vec<u8>>,
}

/// A document's send/receive pipe: plaintext in, encrypted frames out,
/// and back.
pub struct DocSink {
    doc_id: String,
    key: WorkspaceKey,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<SinkEvent>,
}

impl DocSink {
    #[must_use]
    pub fn new(doc_id: impl Into<String>, key: WorkspaceKey) -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            doc_id: doc_id.into(),
            key,
            inner: Mutex::new(Inner { state: State::Pending, queued: Vec::new() }),
            events: tx,
        };
        (sink, rx)
    }

    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Mark the sink open, flushing any writes queued before this call
    /// into ready-to-send frames.
    ///
    /// # Errors
    ///
    /// Returns an error for any queued write that fails to encrypt;
    /// the sink still opens (remaining queued writes are attempted).
    pub fn open(&self) -> Result<Vec<Vec<u8>>, SinkError> {
        let queued = {
            let mut inner = self.inner.lock();
            if inner.state != State::Pending {
                return Ok(Vec::new());
            }
            inner.state = State::Open;
            std::mem::take(&mut inner.queued)
        };
        let _ = self.events.send(SinkEvent::Open);
        let mut frames = Vec::with_capacity(queued.len());
        for plaintext in queued {
            frames.push(self.encode(&plaintext)?);
        }
        Ok(frames)
    }

    /// Encrypt and frame `plaintext` for transmission. Before `open`
    /// has been called, the write is queued and flushed on open
    /// instead of rejected — callers may start producing CRDT updates
    /// before the underlying transport link is ready.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] if the sink has already closed.
    pub fn send(&self, plaintext: &[u8]) -> Result<Option<Vec<u8>>, SinkError> {
        let state = {
            let mut inner = self.inner.lock();
            match inner.state {
                State::Closed => return Err(SinkError::Closed(self.doc_id.clone())),
                State::Pending => {
                    inner.queued.push(plaintext.to_vec());
                    State::Pending
                }
                State::Open => State::Open,
            }
        };
        if state == State::Pending {
            return Ok(None);
        }
        Ok(Some(self.encode(plaintext)?))
    }

    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, SinkError> {
        let ciphertext = encrypt_update(plaintext, &self.key)?;
        Ok(frame_encode(&self.doc_id, &ciphertext)?)
    }

    /// Decode an inbound frame and, on success, emit a
    /// [`SinkEvent::Message`]. A frame that fails to decode — wrong
    /// `doc_id`, malformed framing, or a failed decryption (wrong key,
    /// corrupted ciphertext, stale version) — is dropped silently: a
    /// bad frame is either a routing mistake upstream or tampering,
    /// and neither is something the application should ever see as an
    /// error on an otherwise-healthy sink. [`SinkEvent::Error`] is
    /// reserved for conditions the caller actually needs to react to.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] if the sink has already closed.
    /// A decode/decrypt failure is not an error from this method's
    /// perspective — it returns `Ok(())` with the frame dropped.
    pub fn recv(&self, frame: &[u8]) -> Result<(), SinkError> {
        if self.inner.lock().state == State::Closed {
            return Err(SinkError::Closed(self.doc_id.clone()));
        }
        if let Ok(plaintext) = self.decode(frame) {
            let _ = self.events.send(SinkEvent::Message(plaintext));
        }
        Ok(())
    }

    fn decode(&self, frame: &[u8]) -> Result<Vec<u8>, SinkError> {
        let (doc_id, ciphertext) = frame_decode(frame)?;
        if doc_id != self.doc_id {
            return Err(SinkError::Frame(FrameError::InvalidDocId));
        }
        Ok(decrypt_update(&ciphertext, &self.key)?)
    }

    /// Close the sink. Idempotent; writes after this point fail with
    /// [`SinkError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Closed {
            return;
        }
        inner.state = State::Closed;
        inner.queued.clear();
        drop(inner);
        let _ = self.events.send(SinkEvent::Closed);
    }
}
