//! Asynchronous unlock dispatcher: a bounded queue plus worker pool that
//! runs KMS-bound recovery out of band.
//!
//! The hot request path only ever calls [`Dispatcher::notify_unlock`], which
//! is non-blocking: per-key dedup, a token-bucket rate limit, and a bounded
//! queue protect the service from unlock storms. Workers retry failed
//! executions with jittered exponential backoff, at most [`MAX_ATTEMPTS`]
//! executions per job; failures never surface to the request path.

pub mod executor;
pub mod metrics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use signer_common::{ApiError, ApiResult, ErrorKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::keycache::unlock::{UnlockEvent, UnlockNotifier, UnlockOutcome};
use crate::util::clock::{system_clock, Clock};
use crate::util::rate::TokenBucket;

pub use executor::{KmsExecutor, NoopExecutor, UnlockExecutor, UnlockJob};
pub use metrics::UnlockMetrics;

/// Maximum executions per job (first attempt plus retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Dispatcher configuration. Zero-valued fields take the documented
/// defaults.
#[derive(Debug, Clone)]
pub struct UnlockConfig {
    /// Queue capacity. Default 2048.
    pub max_queue: usize,
    /// Background worker count. Default 16.
    pub workers: usize,
    /// Token-bucket refill rate per second; `0.0` disables rate limiting.
    pub rate_limit: f64,
    /// Token-bucket burst. Default 1.
    pub rate_burst: u32,
    /// First retry delay. Default 50 ms.
    pub backoff_base: Duration,
    /// Retry delay ceiling. Default 1 s.
    pub backoff_max: Duration,
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            max_queue: 2048,
            workers: 16,
            rate_limit: 0.0,
            rate_burst: 1,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
        }
    }
}

impl UnlockConfig {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_queue == 0 {
            self.max_queue = defaults.max_queue;
        }
        if self.workers == 0 {
            self.workers = defaults.workers;
        }
        if self.rate_burst == 0 {
            self.rate_burst = defaults.rate_burst;
        }
        if self.backoff_base.is_zero() {
            self.backoff_base = defaults.backoff_base;
        }
        if self.backoff_max.is_zero() {
            self.backoff_max = defaults.backoff_max;
        }
        self
    }
}

struct JobState {
    event: UnlockEvent,
    request_id: String,
    attempts: u32,
}

/// Bounded-queue unlock dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    cfg: UnlockConfig,
    executor: Arc<dyn UnlockExecutor>,
    metrics: Arc<UnlockMetrics>,
    clock: Arc<dyn Clock>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    limiter: ArcSwapOption<TokenBucket>,
    seq: AtomicU64,
    states: Mutex<HashMap<String, JobState>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create the dispatcher and start its background workers.
    pub fn new(cfg: UnlockConfig, executor: Arc<dyn UnlockExecutor>, metrics: Arc<UnlockMetrics>) -> Self {
        Self::with_clock(cfg, executor, metrics, system_clock())
    }

    pub fn with_clock(
        cfg: UnlockConfig,
        executor: Arc<dyn UnlockExecutor>,
        metrics: Arc<UnlockMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cfg = cfg.normalized();
        let (queue_tx, queue_rx) = mpsc::channel(cfg.max_queue);
        let (shutdown, _) = watch::channel(false);
        let limiter = if cfg.rate_limit > 0.0 {
            Some(Arc::new(TokenBucket::new(
                cfg.rate_limit,
                cfg.rate_burst,
                Arc::clone(&clock),
            )))
        } else {
            None
        };
        let inner = Arc::new(DispatcherInner {
            cfg,
            executor,
            metrics,
            clock,
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            limiter: ArcSwapOption::from(limiter),
            seq: AtomicU64::new(0),
            states: Mutex::new(HashMap::new()),
            shutdown,
            workers: Mutex::new(Vec::new()),
        });
        let dispatcher = Self { inner };
        dispatcher.start_workers();
        dispatcher
    }

    fn start_workers(&self) {
        let mut workers = self.inner.workers.lock();
        for _ in 0..self.inner.cfg.workers {
            let inner = Arc::clone(&self.inner);
            let mut shutdown = inner.shutdown.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    let key = {
                        let mut rx = inner.queue_rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            key = rx.recv() => match key {
                                Some(key) => key,
                                None => return,
                            },
                        }
                    };
                    inner.handle_job(key).await;
                }
            }));
        }
    }

    /// Hot-swap the rate limiter. Non-positive values disable it.
    pub fn update_rate_limit(&self, rate: f64) {
        if rate <= 0.0 {
            self.inner.limiter.store(None);
            return;
        }
        self.inner.limiter.store(Some(Arc::new(TokenBucket::new(
            rate,
            self.inner.cfg.rate_burst,
            Arc::clone(&self.inner.clock),
        ))));
    }

    /// Stop the workers and wait for in-flight jobs to settle. Pending
    /// retries are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let workers: Vec<_> = std::mem::take(&mut *self.inner.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }
    }

    /// Number of keys currently tracked in the pipeline (queued, executing,
    /// or awaiting a retry).
    pub fn pending(&self) -> usize {
        self.inner.states.lock().len()
    }
}

#[async_trait]
impl UnlockNotifier for Dispatcher {
    async fn notify_unlock(&self, mut event: UnlockEvent) -> ApiResult<()> {
        if event.key_id.is_empty() {
            return Err(ApiError::new(
                ErrorKind::InvalidArgument,
                "key id is required for unlock",
            ));
        }
        if event.request_id.is_empty() {
            event.request_id = self.inner.next_request_id(&event.key_id);
        }
        if let Some(limiter) = self.inner.limiter.load_full() {
            if !limiter.allow() {
                return Err(ApiError::new(
                    ErrorKind::RetryLater,
                    "unlock dispatcher rate limited",
                ));
            }
        }

        {
            let mut states = self.inner.states.lock();
            if let Some(state) = states.get_mut(&event.key_id) {
                // Dedup: keep the newest reason for the queued job.
                state.event.reason = event.reason;
                return Ok(());
            }
            states.insert(
                event.key_id.clone(),
                JobState {
                    event: event.clone(),
                    request_id: event.request_id.clone(),
                    attempts: 0,
                },
            );
        }

        match self.inner.queue_tx.try_send(event.key_id.clone()) {
            Ok(()) => {
                self.inner.metrics.inc_queue_depth();
                self.inner
                    .metrics
                    .inc_background(&event.keyspace, &event.reason);
                info!(
                    key = %event.key_id,
                    reason = %event.reason,
                    unlock_request_id = %event.request_id,
                    "unlock enqueued"
                );
                Ok(())
            }
            Err(_) => {
                self.inner.states.lock().remove(&event.key_id);
                Err(ApiError::new(
                    ErrorKind::RetryLater,
                    "unlock dispatcher queue full",
                ))
            }
        }
    }
}

impl DispatcherInner {
    fn next_request_id(&self, key_id: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("unlock-{seq}-{key_id}")
    }

    async fn handle_job(self: &Arc<Self>, key: String) {
        let job = {
            let mut states = self.states.lock();
            match states.get_mut(&key) {
                // Finished while the retry timer was pending.
                None => return,
                Some(state) => {
                    state.attempts += 1;
                    UnlockJob {
                        event: state.event.clone(),
                        request_id: state.request_id.clone(),
                        attempt: state.attempts,
                    }
                }
            }
        };

        let _in_flight = self.metrics.in_flight_guard();
        let start = Instant::now();
        let mut outcome = self.executor.execute(job.clone()).await;
        if outcome.key_id.is_empty() {
            outcome.key_id = job.event.key_id.clone();
        }
        if outcome.keyspace.is_empty() {
            outcome.keyspace = job.event.keyspace.clone();
        }
        if outcome.reason.is_empty() {
            outcome.reason = job.event.reason.clone();
        }
        if outcome.request_id.is_empty() {
            outcome.request_id = job.request_id.clone();
        }
        outcome.attempts = job.attempt;
        self.metrics
            .observe_latency(&job.event.keyspace, start.elapsed().as_secs_f64() * 1000.0);

        if outcome.success {
            self.finish(&key);
            debug!(key = %key, attempts = job.attempt, "unlock completed");
            return;
        }

        if job.attempt >= MAX_ATTEMPTS {
            self.metrics.inc_fail(&job.event.keyspace, &job.event.reason);
            self.finish(&key);
            warn!(
                key = %key,
                reason = %job.event.reason,
                unlock_request_id = %job.request_id,
                "unlock failed permanently"
            );
            return;
        }

        let delay = self.backoff_delay(job.attempt);
        self.metrics.inc_retry(&job.event.keyspace, &job.event.reason);
        info!(
            key = %key,
            attempt = job.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            unlock_request_id = %job.request_id,
            "unlock retry scheduled"
        );
        let tx = self.queue_tx.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(key).await;
                }
            }
        });
    }

    fn finish(&self, key: &str) {
        if self.states.lock().remove(key).is_some() {
            self.metrics.dec_queue_depth();
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let mut delay = self.cfg.backoff_base.saturating_mul(1u32 << shift);
        if delay > self.cfg.backoff_max {
            delay = self.cfg.backoff_max;
        }
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        delay.mul_f64(factor)
    }
}
