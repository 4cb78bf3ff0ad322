//! Single-flight refresh coalescing.
//!
//! For each key id at most one refresh task executes at a time. Concurrent
//! callers either wait for the in-flight outcome ([`RefreshGroup::run`]) or
//! schedule a background refresh and return immediately
//! ([`RefreshGroup::spawn`]). A waiter whose budget expires gets
//! `UNLOCK_REQUIRED` back without cancelling the underlying task, so other
//! waiters may still observe the real outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use signer_common::{ApiError, ApiResult, ErrorKind};
use tokio::sync::watch;
use tracing::warn;

use super::entry::DEFAULT_REFRESH_BUDGET;
use super::metrics::CacheMetrics;
use super::unlock::{UnlockEvent, UnlockNotifier};

/// Outcome of one refresh execution, fanned out to every coalesced waiter.
pub type RefreshOutcome = ApiResult<()>;

/// A single refresh task. Produced fresh per call; dropped unpolled when an
/// in-flight task for the same key already exists.
pub type RefreshTask = BoxFuture<'static, RefreshOutcome>;

/// Coordinates per-key refresh concurrency. Entries depend only on this
/// trait so tests can substitute recording or pass-through schedulers.
#[async_trait]
pub trait RefreshScheduler: Send + Sync {
    /// Run `task` under the single-flight key, waiting at most `wait_budget`
    /// for the shared outcome.
    async fn run(
        &self,
        keyspace: &str,
        key_id: &str,
        wait_budget: Duration,
        task: RefreshTask,
    ) -> RefreshOutcome;

    /// Fire-and-forget variant: schedule `task` under the single-flight key
    /// and return immediately. Failures are logged and, when classified as
    /// `UNLOCK_REQUIRED`, routed to the unlock notifier exactly once.
    fn spawn(&self, keyspace: &str, key_id: &str, task: RefreshTask);
}

/// Single-flight refresh group keyed by opaque key id strings.
#[derive(Clone)]
pub struct RefreshGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    metrics: Arc<CacheMetrics>,
    notifier: Arc<dyn UnlockNotifier>,
    flights: Mutex<HashMap<String, watch::Receiver<Option<RefreshOutcome>>>>,
}

impl RefreshGroup {
    /// Create a group that escalates `UNLOCK_REQUIRED` failures to `notifier`.
    pub fn new(metrics: Arc<CacheMetrics>, notifier: Arc<dyn UnlockNotifier>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                metrics,
                notifier,
                flights: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Join the in-flight refresh for `key_id`, starting one with `task` if
    /// none exists. Returns the receiver for the shared outcome.
    ///
    /// Only the primary execution (the one that actually polls a task)
    /// triggers the unlock side effect.
    fn join(
        &self,
        keyspace: &str,
        key_id: &str,
        task: RefreshTask,
    ) -> watch::Receiver<Option<RefreshOutcome>> {
        let mut flights = self.inner.flights.lock();
        if let Some(rx) = flights.get(key_id) {
            return rx.clone();
        }
        let (tx, rx) = watch::channel(None);
        flights.insert(key_id.to_owned(), rx.clone());
        drop(flights);

        let inner = Arc::clone(&self.inner);
        let keyspace = keyspace.to_owned();
        let key_id = key_id.to_owned();
        tokio::spawn(async move {
            let outcome = task.await;
            inner.flights.lock().remove(&key_id);
            if let Err(err) = &outcome {
                warn!(key = %key_id, keyspace = %keyspace, error = %err, "key refresh failed");
                inner.maybe_notify_unlock(&keyspace, &key_id, err).await;
            }
            // Waiters that already timed out are gone; ignore a closed channel.
            let _ = tx.send(Some(outcome));
        });
        rx
    }
}

impl GroupInner {
    async fn maybe_notify_unlock(&self, keyspace: &str, key_id: &str, err: &ApiError) {
        if err.kind() != ErrorKind::UnlockRequired || key_id.is_empty() {
            return;
        }
        let event = UnlockEvent {
            keyspace: keyspace.to_owned(),
            key_id: key_id.to_owned(),
            reason: err.message().to_owned(),
            refresh_budget: err.refresh_budget().unwrap_or(DEFAULT_REFRESH_BUDGET),
            request_id: String::new(),
        };
        if let Err(notify_err) = self.notifier.notify_unlock(event).await {
            warn!(key = %key_id, error = %notify_err, "notify unlock failed");
        }
    }
}

#[async_trait]
impl RefreshScheduler for RefreshGroup {
    async fn run(
        &self,
        keyspace: &str,
        key_id: &str,
        wait_budget: Duration,
        task: RefreshTask,
    ) -> RefreshOutcome {
        let mut rx = self.join(keyspace, key_id, task);
        let _waiter = self.inner.metrics.waiter_guard(keyspace);

        let wait = async {
            loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(ApiError::new(ErrorKind::Internal, "refresh task aborted"));
                }
            }
        };

        match tokio::time::timeout(wait_budget, wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.inner.metrics.inc_wait_timeout(keyspace);
                warn!(key = %key_id, keyspace = %keyspace, "refresh wait budget expired");
                Err(ApiError::unlock_required("refresh wait timeout", wait_budget))
            }
        }
    }

    fn spawn(&self, keyspace: &str, key_id: &str, task: RefreshTask) {
        let _ = self.join(keyspace, key_id, task);
    }
}

/// Scheduler without coalescing: `run` awaits the task inline under the wait
/// budget and `spawn` detaches it. Default for entries wired outside a
/// shared refresh group (single-key tests, baselines).
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectScheduler;

#[async_trait]
impl RefreshScheduler for DirectScheduler {
    async fn run(
        &self,
        _keyspace: &str,
        key_id: &str,
        wait_budget: Duration,
        task: RefreshTask,
    ) -> RefreshOutcome {
        match tokio::time::timeout(wait_budget, task).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(key = %key_id, "refresh wait budget expired");
                Err(ApiError::unlock_required("refresh wait timeout", wait_budget))
            }
        }
    }

    fn spawn(&self, _keyspace: &str, key_id: &str, task: RefreshTask) {
        let key_id = key_id.to_owned();
        tokio::spawn(async move {
            if let Err(err) = task.await {
                warn!(key = %key_id, error = %err, "background refresh failed");
            }
        });
    }
}
