//! Binary frame layout carried across every transport.
//!
//! ```text
//! +--------+----------+---- docId (utf8) ----+---- ciphertext ----+
//! |version | docIdLen |                      | nonce || secretbox |
//! +--------+----------+----------------------+--------------------+
//!   u8=1     u8=N
//! ```
//!
//! The frame only carries routing metadata (the document id) and an
//! opaque ciphertext; `mesh-proto` does not know about the crypto
//! construction used to produce that ciphertext (that lives in
//! `mesh-core::crypto`). Frames are decoded independently of decryption
//! so that a malformed header can be rejected before a single
//! decryption attempt is made.

/// The only frame version this implementation understands.
pub const FRAME_VERSION: u8 = 1;

/// Errors from encoding or decoding a binary frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The document id is longer than 255 utf-8 bytes.
    #[error("docId too long: {0} bytes (max 255)")]
    DocIdTooLong(usize),
    /// The buffer is too short to contain a header.
    #[error("frame truncated: need at least 2 bytes for header, got {0}")]
    HeaderTruncated(usize),
    /// The buffer is too short to contain the declared docId.
    #[error("frame truncated: docId declares {declared} bytes, only {available} available")]
    DocIdTruncated { declared: usize, available: usize },
    /// The frame's version byte is not one this implementation understands.
    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),
    /// The docId bytes are not valid utf-8.
    #[error("docId is not valid utf-8")]
    InvalidDocId,
}

/// Encode a frame: `version || docIdLen || docId || ciphertext`.
///
/// # Errors
///
/// Returns [`FrameError::DocIdTooLong`] if `doc_id`'s utf-8 encoding
/// exceeds 255 bytes.
pub fn frame_encode(doc_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, FrameError> {
    let doc_id_bytes = doc_id.as_bytes();
    if doc_id_bytes.len() > 255 {
        return Err(FrameError::DocIdTooLong(doc_id_bytes.len()));
    }
    let doc_id_len = doc_id_bytes.len() as u8;

    let mut frame = Vec::with_capacity(2 + doc_id_bytes.len() + ciphertext.len());
    frame.push(FRAME_VERSION);
    frame.push(doc_id_len);
    frame.extend_from_slice(doc_id_bytes);
    frame.extend_from_slice(ciphertext);
    Ok(frame)
}

/// Decode a frame into `(docId, ciphertext)`.
///
/// Frames with an unsupported version or a truncated header are
/// rejected rather than silently truncated.
///
/// # Errors
///
/// Returns a [`FrameError`] variant describing why the frame is
/// malformed.
pub fn frame_decode(bytes: &[u8]) -> Result<(String, Vec<u8>), FrameError> {
    if bytes.len() < 2 {
        return Err(FrameError::HeaderTruncated(bytes.len()));
    }
    let version = bytes[0];
    if version != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let doc_id_len = bytes[1] as usize;
    let available = bytes.len() - 2;
    if available < doc_id_len {
        return Err(FrameError::DocIdTruncated {
            declared: doc_id_len,
            available,
        });
    }

    let doc_id_bytes = &bytes[2..2 + doc_id_len];
    let doc_id = std::str::from_utf8(doc_id_bytes)
        .map_err(|_| FrameError::InvalidDocId)?
        .to_string();
    let ciphertext = bytes[2 + doc_id_len..].to_vec();

    Ok((doc_id, ciphertext))
}
