//! Unlock executors: the KMS-bound recovery invoked by dispatcher workers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::keycache::unlock::{UnlockEvent, UnlockOutcome};
use crate::kms::KmsClient;

/// Payload handed to the executor for one attempt.
#[derive(Debug, Clone)]
pub struct UnlockJob {
    pub event: UnlockEvent,
    pub request_id: String,
    pub attempt: u32,
}

/// Executes the actual unlock (KMS call plus enclave re-seed).
#[async_trait]
pub trait UnlockExecutor: Send + Sync {
    async fn execute(&self, job: UnlockJob) -> UnlockOutcome;
}

/// Executor that succeeds without touching any external dependency. Used
/// until the real KMS wiring is configured, and in drills.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

#[async_trait]
impl UnlockExecutor for NoopExecutor {
    async fn execute(&self, job: UnlockJob) -> UnlockOutcome {
        info!(key = %job.event.key_id, reason = %job.event.reason, "noop unlock executor invoked");
        UnlockOutcome {
            keyspace: job.event.keyspace,
            key_id: job.event.key_id,
            reason: job.event.reason,
            request_id: job.request_id,
            attempts: job.attempt,
            success: true,
            error: None,
        }
    }
}

/// Executor that refreshes the keyspace DEK through the KMS client.
pub struct KmsExecutor {
    client: Arc<KmsClient>,
}

impl KmsExecutor {
    pub fn new(client: Arc<KmsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UnlockExecutor for KmsExecutor {
    async fn execute(&self, job: UnlockJob) -> UnlockOutcome {
        let mut outcome = UnlockOutcome {
            keyspace: job.event.keyspace.clone(),
            key_id: job.event.key_id.clone(),
            reason: job.event.reason.clone(),
            request_id: job.request_id.clone(),
            attempts: job.attempt,
            success: false,
            error: None,
        };
        let start = Instant::now();
        match self.client.generate_data_key(&job.event.key_id).await {
            Ok(_) => {
                outcome.success = true;
                info!(
                    key = %job.event.key_id,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "kms unlock succeeded"
                );
            }
            Err(err) => {
                warn!(key = %job.event.key_id, error = %err, "kms unlock failed");
                outcome.error = Some(err.to_string());
            }
        }
        outcome
    }
}
