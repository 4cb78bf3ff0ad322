//! Static in-process KMS provider and attestor for tests and the baseline
//! wiring used before a real provider is configured.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::{Attestor, DecryptRequest, GenerateDataKeyRequest, KmsError, KmsProvider};

/// Provider returning a fixed key for every call.
#[derive(Debug, Default)]
pub struct StaticProvider {
    key: Vec<u8>,
    fail: bool,
    calls: AtomicU32,
}

impl StaticProvider {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            fail: false,
            calls: AtomicU32::new(0),
        }
    }

    /// Provider whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KmsProvider for StaticProvider {
    async fn decrypt(&self, _req: DecryptRequest) -> Result<Vec<u8>, KmsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(KmsError::Provider("static provider failure".into()));
        }
        Ok(self.key.clone())
    }

    async fn generate_data_key(&self, _req: GenerateDataKeyRequest) -> Result<Vec<u8>, KmsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(KmsError::Provider("static provider failure".into()));
        }
        Ok(self.key.clone())
    }
}

/// Attestor handing out a fixed document and accepting everything.
#[derive(Debug, Default)]
pub struct StaticAttestor {
    document: Vec<u8>,
    fetches: AtomicU32,
}

impl StaticAttestor {
    pub fn new(document: Vec<u8>) -> Self {
        Self {
            document,
            fetches: AtomicU32::new(0),
        }
    }

    pub fn document_fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Attestor for StaticAttestor {
    async fn document(&self) -> Result<Vec<u8>, KmsError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.document.clone())
    }

    fn verify(&self, _document: &[u8]) -> Result<(), KmsError> {
        Ok(())
    }
}
