//! Unlock event types and the notifier capability.
//!
//! The refresh group and the unlock responder hold an explicitly injected
//! [`UnlockNotifier`]; there is no process-wide default. Components that do
//! not care pass [`NoopNotifier`].

use std::time::Duration;

use async_trait::async_trait;
use signer_common::ApiResult;

/// Context of one unlock request pushed to the background dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockEvent {
    pub keyspace: String,
    pub key_id: String,
    /// Why the hot path could not be served locally.
    pub reason: String,
    /// Refresh budget in force when the failure occurred; used to size the
    /// client retry hint.
    pub refresh_budget: Duration,
    /// Correlation id; assigned by the dispatcher when empty.
    pub request_id: String,
}

/// Result of one background unlock execution, reported for metrics and audit.
#[derive(Debug, Clone, Default)]
pub struct UnlockOutcome {
    pub keyspace: String,
    pub key_id: String,
    pub reason: String,
    pub request_id: String,
    pub attempts: u32,
    pub success: bool,
    pub error: Option<String>,
}

/// Asynchronous unlock channel. `notify_unlock` adds a key to the background
/// unlock queue; `ack` is invoked with the execution result once the
/// background work settles.
#[async_trait]
pub trait UnlockNotifier: Send + Sync {
    async fn notify_unlock(&self, event: UnlockEvent) -> ApiResult<()>;

    /// Called when a background unlock finishes. Default: ignore.
    async fn ack(&self, _result: UnlockOutcome) {}
}

/// Notifier that drops every event. Used where unlock escalation is not
/// wired, e.g. in tests and single-enclave baselines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl UnlockNotifier for NoopNotifier {
    async fn notify_unlock(&self, _event: UnlockEvent) -> ApiResult<()> {
        Ok(())
    }
}
