//! Per-keyspace DEK store and the sealed-blob cipher used for local
//! rehydration.
//!
//! A key's ciphertext blob is `nonce || AES-256-GCM-SIV(ciphertext + tag)`
//! under the keyspace DEK. Rehydration opens the blob locally; no remote KMS
//! call is involved while the DEK remains valid.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use thiserror::Error;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Byte length of a DEK and of every plaintext private key (32 = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Errors produced by the DEK layer.
#[derive(Debug, Error)]
pub enum DekError {
    /// No DEK has been seeded for the requested keyspace.
    #[error("no DEK for keyspace {0:?}")]
    UnknownKeyspace(String),

    /// The key material has an unexpected length.
    #[error("DEK has invalid length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),

    /// The blob is too short to contain a nonce.
    #[error("cipher blob is truncated")]
    TruncatedBlob,

    /// AEAD encryption or decryption failed (wrong DEK or tampered blob).
    #[error("aead operation failed")]
    AeadFailure,

    /// The opened blob is not a {KEY_LEN}-byte key.
    #[error("opened blob has invalid key length: {0}")]
    InvalidPlainLength(usize),
}

/// Fixed-size key buffer holding exactly [`KEY_LEN`] bytes.
///
/// The memory is overwritten with zeroes on drop so plaintext key material
/// does not outlive its use.
#[derive(Clone)]
pub struct DekBytes(pub Box<[u8; KEY_LEN]>);

impl Zeroize for DekBytes {
    fn zeroize(&mut self) {
        self.0.as_mut().zeroize();
    }
}

impl Drop for DekBytes {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for DekBytes {}

impl std::fmt::Debug for DekBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("DekBytes([REDACTED])")
    }
}

/// Thread-safe store of the current DEK per keyspace.
///
/// Many concurrent readers (rehydrations) share the lock; the background
/// unlock path swaps in a new key with a short write lock.
#[derive(Clone, Debug, Default)]
pub struct DekStore {
    inner: Arc<RwLock<HashMap<String, DekBytes>>>,
}

impl DekStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a DEK is cached for `keyspace`.
    pub async fn is_ready(&self, keyspace: &str) -> bool {
        self.inner.read().await.contains_key(keyspace)
    }

    /// Store (or replace) the DEK for `keyspace`.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::InvalidLength`] if `key_bytes` is not exactly
    /// [`KEY_LEN`] bytes.
    pub async fn store(&self, keyspace: &str, key_bytes: &[u8]) -> Result<(), DekError> {
        if key_bytes.len() != KEY_LEN {
            return Err(DekError::InvalidLength(key_bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(key_bytes);
        let mut lock = self.inner.write().await;
        lock.insert(keyspace.to_owned(), DekBytes(buf));
        Ok(())
    }

    /// Borrow a clone of the current DEK bytes for `keyspace`.
    ///
    /// The clone is a short-lived copy; it zeroes itself on drop.
    pub async fn current(&self, keyspace: &str) -> Result<DekBytes, DekError> {
        let lock = self.inner.read().await;
        lock.get(keyspace)
            .cloned()
            .ok_or_else(|| DekError::UnknownKeyspace(keyspace.to_owned()))
    }

    /// Drop the DEK for `keyspace`, forcing entries to go through unlock.
    pub async fn remove(&self, keyspace: &str) {
        self.inner.write().await.remove(keyspace);
    }
}

/// Seal a [`KEY_LEN`]-byte plaintext key into a ciphertext blob under `dek`.
///
/// The output layout is `nonce || ciphertext+tag` with a fresh random nonce
/// per call.
pub fn seal_key_blob(dek: &[u8], plain: &[u8; KEY_LEN]) -> Result<Vec<u8>, DekError> {
    let cipher = build_cipher(dek)?;
    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plain.as_slice())
        .map_err(|_| DekError::AeadFailure)?;
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a ciphertext blob produced by [`seal_key_blob`] back into the
/// [`KEY_LEN`]-byte plaintext key.
pub fn open_key_blob(dek: &[u8], blob: &[u8]) -> Result<[u8; KEY_LEN], DekError> {
    if blob.len() < NONCE_LEN {
        return Err(DekError::TruncatedBlob);
    }
    let cipher = build_cipher(dek)?;
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let mut plain = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| DekError::AeadFailure)?;
    if plain.len() != KEY_LEN {
        let len = plain.len();
        plain.zeroize();
        return Err(DekError::InvalidPlainLength(len));
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&plain);
    plain.zeroize();
    Ok(out)
}

fn build_cipher(dek: &[u8]) -> Result<Aes256GcmSiv, DekError> {
    if dek.len() != KEY_LEN {
        return Err(DekError::InvalidLength(dek.len()));
    }
    Aes256GcmSiv::new_from_slice(dek).map_err(|_| DekError::InvalidLength(dek.len()))
}
