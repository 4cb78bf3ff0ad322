//! Unlock responder: turns `UNLOCK_REQUIRED` failures into the wire-visible
//! correlation id + retry hint pair, and pushes the event to the background
//! unlock queue best-effort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use signer_common::{ApiError, ErrorKind};
use tracing::debug;

use crate::keycache::unlock::{UnlockEvent, UnlockNotifier};

const DEFAULT_MIN_RETRY: Duration = Duration::from_millis(50);
const DEFAULT_MAX_RETRY: Duration = Duration::from_millis(200);

/// Responder parameters. A missing queue degrades to hint generation only.
#[derive(Default)]
pub struct UnlockResponderConfig {
    pub queue: Option<Arc<dyn UnlockNotifier>>,
    pub keyspace: String,
    pub min_retry: Duration,
    pub max_retry: Duration,
}

/// What the front-end needs to answer an unlock failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockAdvice {
    pub request_id: String,
    pub retry_after: Duration,
}

/// Translates unlock errors for the front-ends.
pub struct UnlockResponder {
    queue: Option<Arc<dyn UnlockNotifier>>,
    keyspace: String,
    min_retry: Duration,
    max_retry: Duration,
    seq: AtomicU64,
}

impl UnlockResponder {
    pub fn new(cfg: UnlockResponderConfig) -> Self {
        let min_retry = if cfg.min_retry.is_zero() {
            DEFAULT_MIN_RETRY
        } else {
            cfg.min_retry
        };
        let max_retry = if cfg.max_retry.is_zero() {
            DEFAULT_MAX_RETRY
        } else {
            cfg.max_retry
        };
        Self {
            queue: cfg.queue,
            keyspace: if cfg.keyspace.is_empty() {
                "default".to_owned()
            } else {
                cfg.keyspace
            },
            min_retry,
            max_retry: max_retry.max(min_retry),
            seq: AtomicU64::new(0),
        }
    }

    /// Handle an unlock failure: sample the retry hint, assign a correlation
    /// id, and enqueue the unlock event when a queue is configured.
    pub async fn handle(&self, key_id: &str, err: &ApiError) -> UnlockAdvice {
        let retry_after = self.sample_retry();
        let request_id = self.next_request_id(key_id);
        if let Some(queue) = &self.queue {
            if !key_id.is_empty() {
                let event = UnlockEvent {
                    keyspace: self.keyspace.clone(),
                    key_id: key_id.to_owned(),
                    reason: err.message().to_owned(),
                    refresh_budget: err.refresh_budget().unwrap_or_default(),
                    request_id: request_id.clone(),
                };
                // Best-effort: a saturated queue must not fail the response.
                if let Err(notify_err) = queue.notify_unlock(event).await {
                    debug!(key = %key_id, error = %notify_err, "unlock enqueue dropped");
                }
            }
        }
        UnlockAdvice {
            request_id,
            retry_after,
        }
    }

    fn sample_retry(&self) -> Duration {
        if self.max_retry <= self.min_retry {
            return self.min_retry;
        }
        rand::thread_rng().gen_range(self.min_retry..=self.max_retry)
    }

    fn next_request_id(&self, key_id: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let key_id = if key_id.is_empty() { "unknown" } else { key_id };
        format!("unlock-{seq}-{key_id}")
    }
}

/// Whether `err` should be routed through the unlock responder.
pub fn is_unlock_error(err: &ApiError) -> bool {
    err.kind() == ErrorKind::UnlockRequired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keycache::unlock::testing::RecordingNotifier;

    fn unlock_err() -> ApiError {
        ApiError::unlock_required("dek expired", Duration::from_millis(3))
    }

    #[tokio::test]
    async fn hint_sampled_within_bounds() {
        let r = UnlockResponder::new(UnlockResponderConfig {
            min_retry: Duration::from_millis(50),
            max_retry: Duration::from_millis(200),
            ..UnlockResponderConfig::default()
        });
        for _ in 0..32 {
            let advice = r.handle("k1", &unlock_err()).await;
            assert!(advice.retry_after >= Duration::from_millis(50));
            assert!(advice.retry_after <= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn request_ids_are_sequenced_and_keyed() {
        let r = UnlockResponder::new(UnlockResponderConfig::default());
        let a = r.handle("k1", &unlock_err()).await;
        let b = r.handle("k1", &unlock_err()).await;
        assert_eq!(a.request_id, "unlock-1-k1");
        assert_eq!(b.request_id, "unlock-2-k1");
    }

    #[tokio::test]
    async fn empty_key_id_becomes_unknown() {
        let r = UnlockResponder::new(UnlockResponderConfig::default());
        let advice = r.handle("", &unlock_err()).await;
        assert_eq!(advice.request_id, "unlock-1-unknown");
    }

    #[tokio::test]
    async fn queue_receives_event_with_reason_and_budget() {
        let queue = RecordingNotifier::default();
        let r = UnlockResponder::new(UnlockResponderConfig {
            queue: Some(Arc::new(queue.clone())),
            keyspace: "prod".into(),
            min_retry: Duration::from_millis(50),
            max_retry: Duration::from_millis(50),
        });
        let advice = r.handle("k1", &unlock_err()).await;
        assert_eq!(advice.retry_after, Duration::from_millis(50));

        let events = queue.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key_id, "k1");
        assert_eq!(events[0].keyspace, "prod");
        assert_eq!(events[0].reason, "dek expired");
        assert_eq!(events[0].refresh_budget, Duration::from_millis(3));
        assert_eq!(events[0].request_id, advice.request_id);
    }

    #[tokio::test]
    async fn empty_key_id_is_not_enqueued() {
        let queue = RecordingNotifier::default();
        let r = UnlockResponder::new(UnlockResponderConfig {
            queue: Some(Arc::new(queue.clone())),
            ..UnlockResponderConfig::default()
        });
        r.handle("", &unlock_err()).await;
        assert!(queue.events().is_empty());
    }
}
