//! Local rehydration: reconstructing a plaintext key from its ciphertext
//! blob with a still-valid DEK, without any remote KMS call.

use async_trait::async_trait;
use signer_common::{ApiError, ApiResult, ErrorKind};

use super::dek::{open_key_blob, DekStore, KEY_LEN};

/// Reconstructs the plaintext key for `key_id` from its ciphertext blob.
///
/// Implementations must not retain the returned bytes.
#[async_trait]
pub trait Rehydrator: Send + Sync {
    async fn rehydrate(&self, key_id: &str, cipher_blob: &[u8]) -> ApiResult<[u8; KEY_LEN]>;
}

/// Placeholder rehydrator that always fails; entries wired with it can only
/// recover through the out-of-band unlock path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRehydrator;

#[async_trait]
impl Rehydrator for NoopRehydrator {
    async fn rehydrate(&self, _key_id: &str, _cipher_blob: &[u8]) -> ApiResult<[u8; KEY_LEN]> {
        Err(ApiError::new(
            ErrorKind::Internal,
            "rehydrator not configured",
        ))
    }
}

/// DEK-backed rehydrator: opens the blob with the current DEK of its
/// configured keyspace.
#[derive(Clone, Debug)]
pub struct DekRehydrator {
    store: DekStore,
    keyspace: String,
}

impl DekRehydrator {
    pub fn new(store: DekStore, keyspace: impl Into<String>) -> Self {
        Self {
            store,
            keyspace: keyspace.into(),
        }
    }
}

#[async_trait]
impl Rehydrator for DekRehydrator {
    async fn rehydrate(&self, key_id: &str, cipher_blob: &[u8]) -> ApiResult<[u8; KEY_LEN]> {
        let dek = self.store.current(&self.keyspace).await.map_err(|e| {
            ApiError::new(ErrorKind::Internal, format!("dek unavailable for {key_id}: {e}"))
        })?;
        open_key_blob(&dek.0[..], cipher_blob)
            .map_err(|e| ApiError::new(ErrorKind::Internal, format!("open blob for {key_id}: {e}")))
    }
}
