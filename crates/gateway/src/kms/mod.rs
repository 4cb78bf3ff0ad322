//! KMS access for the unlock path: attestation-bound decrypt and data-key
//! generation with bounded retries.
//!
//! The concrete KMS provider is out of scope; this module defines the
//! capability surface ([`KmsProvider`], [`Attestor`]) and the retrying
//! client wrapped around them. Attestation documents are cached for a short
//! TTL so retries and bursts do not re-attest on every call.

pub mod mock;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::util::backoff::{Backoff, BackoffConfig};
use crate::util::clock::{system_clock, Clock};

/// Errors surfaced by KMS operations.
#[derive(Debug, Clone, Error)]
pub enum KmsError {
    #[error("kms provider error: {0}")]
    Provider(String),

    #[error("attestation error: {0}")]
    Attestation(String),

    #[error("provider and attestor are required")]
    Misconfigured,

    #[error("kms retries exhausted")]
    RetriesExhausted,
}

/// Decrypt call payload.
#[derive(Debug, Clone)]
pub struct DecryptRequest {
    pub key_id: String,
    pub ciphertext: Vec<u8>,
    pub attestation: Vec<u8>,
}

/// Data-key generation payload.
#[derive(Debug, Clone)]
pub struct GenerateDataKeyRequest {
    pub key_id: String,
    pub attestation: Vec<u8>,
}

/// Underlying KMS capability.
#[async_trait]
pub trait KmsProvider: Send + Sync {
    async fn decrypt(&self, req: DecryptRequest) -> Result<Vec<u8>, KmsError>;
    async fn generate_data_key(&self, req: GenerateDataKeyRequest) -> Result<Vec<u8>, KmsError>;
}

/// Produces and verifies enclave attestation documents.
#[async_trait]
pub trait Attestor: Send + Sync {
    async fn document(&self) -> Result<Vec<u8>, KmsError>;
    fn verify(&self, document: &[u8]) -> Result<(), KmsError>;
}

/// Retry and attestation-cache behaviour.
#[derive(Debug, Clone)]
pub struct KmsConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
    pub attestation_cache_ttl: Duration,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            jitter: 0.2,
            attestation_cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

struct AttestationCache {
    document: Vec<u8>,
    expires_at: SystemTime,
}

/// Retrying KMS client.
pub struct KmsClient {
    provider: Arc<dyn KmsProvider>,
    attestor: Arc<dyn Attestor>,
    cfg: KmsConfig,
    clock: Arc<dyn Clock>,
    cache: Mutex<Option<AttestationCache>>,
}

impl KmsClient {
    pub fn new(
        provider: Arc<dyn KmsProvider>,
        attestor: Arc<dyn Attestor>,
        cfg: KmsConfig,
    ) -> Result<Self, KmsError> {
        Self::with_clock(provider, attestor, cfg, system_clock())
    }

    pub fn with_clock(
        provider: Arc<dyn KmsProvider>,
        attestor: Arc<dyn Attestor>,
        mut cfg: KmsConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KmsError> {
        let defaults = KmsConfig::default();
        if cfg.max_attempts == 0 {
            cfg.max_attempts = defaults.max_attempts;
        }
        if cfg.initial_backoff.is_zero() {
            cfg.initial_backoff = defaults.initial_backoff;
        }
        if cfg.max_backoff.is_zero() {
            cfg.max_backoff = defaults.max_backoff;
        }
        if cfg.jitter <= 0.0 {
            cfg.jitter = defaults.jitter;
        }
        if cfg.attestation_cache_ttl.is_zero() {
            cfg.attestation_cache_ttl = defaults.attestation_cache_ttl;
        }
        Ok(Self {
            provider,
            attestor,
            cfg,
            clock,
            cache: Mutex::new(None),
        })
    }

    /// Decrypt `ciphertext` with a fresh or cached attestation attached.
    pub async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let mut backoff = self.backoff();
        let mut last_err = None;
        for attempt in 1..=self.cfg.max_attempts {
            match self.attestation().await {
                Err(err) => {
                    warn!(attempt, error = %err, "fetch attestation failed");
                    last_err = Some(err);
                }
                Ok(doc) => {
                    let req = DecryptRequest {
                        key_id: key_id.to_owned(),
                        ciphertext: ciphertext.to_vec(),
                        attestation: doc,
                    };
                    match self.provider.decrypt(req).await {
                        Ok(plain) => return Ok(plain),
                        Err(err) => {
                            warn!(attempt, error = %err, "kms decrypt failed");
                            last_err = Some(err);
                        }
                    }
                }
            }
            if attempt < self.cfg.max_attempts {
                tokio::time::sleep(backoff.next()).await;
            }
        }
        Err(last_err.unwrap_or(KmsError::RetriesExhausted))
    }

    /// Generate a fresh data key for `key_id`'s keyspace.
    pub async fn generate_data_key(&self, key_id: &str) -> Result<Vec<u8>, KmsError> {
        let mut backoff = self.backoff();
        let mut last_err = None;
        for attempt in 1..=self.cfg.max_attempts {
            match self.attestation().await {
                Err(err) => {
                    warn!(attempt, error = %err, "fetch attestation failed");
                    last_err = Some(err);
                }
                Ok(doc) => {
                    let req = GenerateDataKeyRequest {
                        key_id: key_id.to_owned(),
                        attestation: doc,
                    };
                    match self.provider.generate_data_key(req).await {
                        Ok(key) => return Ok(key),
                        Err(err) => {
                            warn!(attempt, error = %err, "kms generate data key failed");
                            last_err = Some(err);
                        }
                    }
                }
            }
            if attempt < self.cfg.max_attempts {
                tokio::time::sleep(backoff.next()).await;
            }
        }
        Err(last_err.unwrap_or(KmsError::RetriesExhausted))
    }

    async fn attestation(&self) -> Result<Vec<u8>, KmsError> {
        let now = self.clock.now();
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref() {
                if now < cached.expires_at {
                    return Ok(cached.document.clone());
                }
            }
        }
        let document = self.attestor.document().await?;
        self.attestor.verify(&document)?;
        *self.cache.lock() = Some(AttestationCache {
            document: document.clone(),
            expires_at: now + self.cfg.attestation_cache_ttl,
        });
        Ok(document)
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(BackoffConfig {
            initial: self.cfg.initial_backoff,
            max: self.cfg.max_backoff,
            jitter: self.cfg.jitter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{StaticAttestor, StaticProvider};
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl KmsProvider for FlakyProvider {
        async fn decrypt(&self, _req: DecryptRequest) -> Result<Vec<u8>, KmsError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                return Err(KmsError::Provider("transient".into()));
            }
            Ok(vec![0xAB; 32])
        }

        async fn generate_data_key(
            &self,
            _req: GenerateDataKeyRequest,
        ) -> Result<Vec<u8>, KmsError> {
            Err(KmsError::Provider("unused".into()))
        }
    }

    fn fast_cfg() -> KmsConfig {
        KmsConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..KmsConfig::default()
        }
    }

    #[tokio::test]
    async fn decrypt_retries_transient_failures() {
        let provider = Arc::new(FlakyProvider {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        });
        let client = KmsClient::new(
            provider.clone(),
            Arc::new(StaticAttestor::default()),
            fast_cfg(),
        )
        .unwrap();
        let plain = client.decrypt("k1", b"cipher").await.unwrap();
        assert_eq!(plain, vec![0xAB; 32]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn decrypt_gives_up_after_max_attempts() {
        let provider = Arc::new(FlakyProvider {
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let client = KmsClient::new(
            provider.clone(),
            Arc::new(StaticAttestor::default()),
            fast_cfg(),
        )
        .unwrap();
        let err = client.decrypt("k1", b"cipher").await.unwrap_err();
        assert!(matches!(err, KmsError::Provider(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attestation_document_is_cached() {
        let attestor = Arc::new(StaticAttestor::default());
        let client = KmsClient::new(
            Arc::new(StaticProvider::new(vec![0x01; 32])),
            attestor.clone(),
            fast_cfg(),
        )
        .unwrap();
        client.generate_data_key("k1").await.unwrap();
        client.generate_data_key("k1").await.unwrap();
        assert_eq!(attestor.document_fetches(), 1);
    }

    #[tokio::test]
    async fn attestation_refetched_after_ttl() {
        let clock = Arc::new(crate::util::clock::FakeClock::epoch());
        let attestor = Arc::new(StaticAttestor::default());
        let client = KmsClient::with_clock(
            Arc::new(StaticProvider::new(vec![0x01; 32])),
            attestor.clone(),
            KmsConfig {
                attestation_cache_ttl: Duration::from_secs(10),
                ..fast_cfg()
            },
            clock.clone(),
        )
        .unwrap();
        client.generate_data_key("k1").await.unwrap();
        clock.advance(Duration::from_secs(11));
        client.generate_data_key("k1").await.unwrap();
        assert_eq!(attestor.document_fetches(), 2);
    }
}
