//! Confidentiality and integrity of payloads under the workspace key.
//!
//! This module has no handshake state and no per-peer session — every
//! workspace member holds the same 32-byte symmetric secret out of
//! band (identity and key distribution are external collaborators, see
//! crate-level docs). `encrypt_update`/`decrypt_update` are pure
//! functions of `(plaintext, key)` and `(packed, key)` respectively,
//! implementing XSalsa20-Poly1305 "secretbox" semantics bit-exact with
//! the wire format other implementations of this protocol use.

use rand::RngCore;
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Key, Nonce, XSalsa20Poly1305};

/// Nonce length for the secretbox construction.
const NONCE_LEN: usize = 24;
/// Poly1305 authentication tag length.
const TAG_LEN: usize = 16;
/// Big-endian length header prepended to plaintext before padding.
const LENGTH_HEADER_LEN: usize = 4;
/// Padded plaintext is rounded up to a multiple of this many bytes.
const PAD_BLOCK: usize = 4096;
/// Maximum plaintext size accepted by `encrypt_update`/`decrypt_update`.
const MAX_PLAINTEXT_LEN: usize = 100 * 1024 * 1024;
/// Minimum length of a well-formed packed ciphertext: nonce + tag + length header.
const MIN_PACKED_LEN: usize = NONCE_LEN + TAG_LEN + LENGTH_HEADER_LEN;

/// A 32-byte symmetric secret shared out-of-band among workspace members.
///
/// Zeroed on drop; never `Debug`-printed in full (the `Debug` impl
/// below elides the bytes).
#[derive(Clone, zeroize::ZeroizeOnDrop)]
pub struct WorkspaceKey([u8; 32]);

impl std::fmt::Debug for WorkspaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceKey").field("bytes", &"<redacted>").finish()
    }
}

impl WorkspaceKey {
    /// Construct a key from raw bytes, rejecting the all-zero key (a
    /// common construction-bug signature).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if `bytes` is all zero.
    pub fn new(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        if bytes == [0u8; 32] {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Self(bytes))
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Errors from `encrypt_update`/`decrypt_update`.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The plaintext violated a documented precondition: empty, or
    /// larger than 100 MiB.
    #[error("invalid input: plaintext must be 1..=100MiB")]
    InvalidInput,
    /// The key is not exactly 32 bytes, or is the all-zero key.
    #[error("invalid key: must be 32 non-zero bytes")]
    InvalidKey,
    /// The ciphertext did not authenticate. Never logged with the
    /// ciphertext bytes; the caller must drop the frame silently and
    /// must not punish the sending peer for this (spec §7: a replay
    /// could otherwise be used to trigger a denial-of-service against
    /// legitimate peers).
    #[error("authentication failed")]
    AuthFail,
}

/// Encrypt `plaintext` under `key`, returning `nonce || secretbox(padded, nonce, key)`.
///
/// `padded` is `u32_be(len(plaintext)) || plaintext || zero-pad`,
/// rounded up to the next 4096-byte boundary.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidInput`] if `plaintext` is empty or
/// exceeds 100 MiB.
pub fn encrypt_update(plaintext: &[u8], key: &WorkspaceKey) -> Result<Vec<u8>, CryptoError> {
    if plaintext.is_empty() || plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(CryptoError::InvalidInput);
    }

    let header_and_body_len = LENGTH_HEADER_LEN + plaintext.len();
    let padded_len = header_and_body_len.div_ceil(PAD_BLOCK) * PAD_BLOCK;

    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(padded_len, 0);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = XSalsa20Poly1305::new(Key::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(nonce, padded.as_slice())
        .map_err(|_| CryptoError::InvalidInput)?;

    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(packed)
}

/// Decrypt a packed secretbox produced by [`encrypt_update`], recovering
/// the original plaintext.
///
/// Fails closed: any malformed length, tag mismatch, or inconsistent
/// recovered length returns an error and never returns partial data.
///
/// # Errors
///
/// - [`CryptoError::InvalidInput`] if `packed` is shorter than the
///   minimum frame (nonce + tag + length header).
/// - [`CryptoError::AuthFail`] if the Poly1305 tag does not verify, or
///   the recovered length header is out of range.
pub fn decrypt_update(packed: &[u8], key: &WorkspaceKey) -> Result<Vec<u8>, CryptoError> {
    if packed.len() < MIN_PACKED_LEN {
        return Err(CryptoError::InvalidInput);
    }

    let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = XSalsa20Poly1305::new(Key::from_slice(key.as_bytes()));
    let padded = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthFail)?;

    if padded.len() < LENGTH_HEADER_LEN {
        return Err(CryptoError::AuthFail);
    }
    let (len_bytes, body) = padded.split_at(LENGTH_HEADER_LEN);
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;

    if len > body.len() || len > MAX_PLAINTEXT_LEN {
        return Err(CryptoError::AuthFail);
    }

    Ok(body[..len].to_vec())
}

/// Constant-time byte-slice equality, independent of where the first
/// mismatch occurs.
#[must_use]
pub fn timing_safe_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Best-effort secure erase: overwrite `buf` with random bytes, then
/// zero it. May be a no-op if `buf` refers to immutable memory the
/// caller cannot actually overwrite — this is advisory hardening, not
/// a guarantee against a determined local attacker.
pub fn secure_wipe(buf: &mut [u8]) {
    rand::rng().fill_bytes(buf);
    buf.fill(0);
}
