//! Per-target bounded pools of long-lived streaming sessions to the enclave
//! signers.
//!
//! Each registered target keeps a ready queue of open channels bounded by
//! `max_conns`, a background warmer that converges on `min_conns`, a circuit
//! breaker fed by stream resets and health probes, and a per-connection
//! supervisor probing the standard gRPC health service. Acquisition never
//! blocks past `acquire_timeout`; transient dial failures retry in the
//! background with exponential backoff.

pub mod breaker;
pub mod endpoint;
pub mod metrics;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tonic::transport::Channel;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tracing::{debug, warn};

use crate::rpc::{SignerClient, SERVICE_NAME};
use crate::util::backoff::{Backoff, BackoffConfig};

pub use breaker::{BreakerState, CircuitBreaker};
pub use metrics::PoolMetrics;

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("enclave target not registered")]
    TargetNotFound,

    #[error("enclave pool is draining")]
    PoolDraining,

    #[error("acquire enclave connection timeout")]
    AcquireTimeout,

    #[error("invalid enclave endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid pool size: min={0} max={1}")]
    InvalidSize(usize, usize),

    #[error("pool is closed")]
    Closed,

    #[error("dial failed: {0}")]
    Dial(#[from] tonic::transport::Error),
}

/// Hot-tunable pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_conns: usize,
    pub max_conns: usize,
    pub acquire_timeout: Duration,
    pub dial_timeout: Duration,
    /// Per-RPC timeout applied to the channel's service policy.
    pub call_timeout: Duration,
    pub keepalive_time: Duration,
    pub keepalive_timeout: Duration,
    pub health_check_interval: Duration,
    pub service_name: String,
    pub backoff: BackoffConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_conns: 16,
            max_conns: 32,
            acquire_timeout: Duration::from_millis(250),
            dial_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_secs(2),
            keepalive_time: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(5),
            service_name: SERVICE_NAME.to_owned(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl PoolConfig {
    fn normalized(mut self) -> Self {
        if self.max_conns < self.min_conns {
            self.max_conns = self.min_conns;
        }
        self
    }
}

/// One enclave access point.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub id: String,
    pub endpoint: String,
    pub metadata: HashMap<String, String>,
}

/// Opens a channel to a target. Swappable so tests can avoid real sockets.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &Target, cfg: &PoolConfig) -> Result<Channel, PoolError>;
}

/// Production dialer: scheme-based transport selection with keepalive and
/// per-call timeout policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointDialer;

#[async_trait]
impl Dialer for EndpointDialer {
    async fn dial(&self, target: &Target, cfg: &PoolConfig) -> Result<Channel, PoolError> {
        endpoint::connect(&target.endpoint, cfg).await
    }
}

// Shared by the pool handle and every target pool; owns no targets, so the
// ownership graph stays acyclic.
struct PoolCore {
    cfg: ArcSwap<PoolConfig>,
    metrics: Arc<PoolMetrics>,
    dialer: Arc<dyn Dialer>,
    shutdown: watch::Sender<bool>,
}

impl PoolCore {
    fn config(&self) -> Arc<PoolConfig> {
        self.cfg.load_full()
    }
}

/// Connection pool over all registered enclave targets.
#[derive(Clone)]
pub struct Pool {
    core: Arc<PoolCore>,
    targets: Arc<RwLock<HashMap<String, Arc<TargetPool>>>>,
}

impl Pool {
    /// Create a pool with the production dialer.
    pub fn new(cfg: PoolConfig, metrics: Arc<PoolMetrics>) -> Result<Self, PoolError> {
        Self::with_dialer(cfg, metrics, Arc::new(EndpointDialer))
    }

    /// Create a pool with a custom dialer.
    pub fn with_dialer(
        cfg: PoolConfig,
        metrics: Arc<PoolMetrics>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, PoolError> {
        if cfg.min_conns == 0 || cfg.max_conns == 0 {
            return Err(PoolError::InvalidSize(cfg.min_conns, cfg.max_conns));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            core: Arc::new(PoolCore {
                cfg: ArcSwap::from_pointee(cfg.normalized()),
                metrics,
                dialer,
                shutdown,
            }),
            targets: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> PoolConfig {
        (*self.core.config()).clone()
    }

    /// Hot-update the configuration; shrinks trim ready queues and grows
    /// schedule warm-up.
    pub fn update_config(&self, cfg: PoolConfig) {
        self.core.cfg.store(Arc::new(cfg.normalized()));
        for tp in self.targets.read().values() {
            tp.trim_ready();
            tp.spawn_warmer();
        }
    }

    /// Update only the connection count bounds.
    pub fn resize(&self, min_conns: usize, max_conns: usize) {
        let mut cfg = self.config();
        cfg.min_conns = min_conns;
        cfg.max_conns = max_conns;
        self.update_config(cfg);
    }

    /// Register or update a target. Registering schedules warm-up toward
    /// `min_conns`; re-registering a drained target restores service.
    pub fn register_target(&self, target: Target) {
        if target.id.is_empty() {
            return;
        }
        let mut targets = self.targets.write();
        if let Some(existing) = targets.get(&target.id) {
            if !existing.is_closed() {
                existing.update_target(target);
                return;
            }
        }
        let tp = TargetPool::new(Arc::clone(&self.core), target.clone());
        tp.spawn_warmer();
        targets.insert(target.id, tp);
    }

    /// Remove a target and close all its connections. Idempotent.
    pub fn remove_target(&self, id: &str) {
        if let Some(tp) = self.targets.write().remove(id) {
            tp.close();
        }
    }

    /// Borrow a connection to `target_id`, bounded by the acquire timeout.
    pub async fn acquire(&self, target_id: &str) -> Result<Lease, PoolError> {
        let tp = self
            .targets
            .read()
            .get(target_id)
            .cloned()
            .ok_or(PoolError::TargetNotFound)?;
        tp.acquire().await
    }

    /// Mark `target_id` as refusing new leases and close its sessions.
    /// In-flight leases finish on their own and are then closed.
    pub fn drain(&self, target_id: &str) -> Result<(), PoolError> {
        let tp = self
            .targets
            .read()
            .get(target_id)
            .cloned()
            .ok_or(PoolError::TargetNotFound)?;
        tp.drain();
        Ok(())
    }

    /// Number of registered targets.
    pub fn target_count(&self) -> usize {
        self.targets.read().len()
    }

    /// Ids of all registered targets.
    pub fn target_ids(&self) -> Vec<String> {
        self.targets.read().keys().cloned().collect()
    }

    /// Stop all background tasks and close every connection.
    pub fn close(&self) {
        let _ = self.core.shutdown.send(true);
        let mut targets = self.targets.write();
        for tp in targets.values() {
            tp.close();
        }
        targets.clear();
    }
}

// ---------------------------------------------------------------------------
// Per-target pool
// ---------------------------------------------------------------------------

const BREAKER_THRESHOLD: u32 = 3;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(1);

struct TargetPool {
    core: Arc<PoolCore>,
    id: String,
    target: Mutex<Target>,
    breaker: CircuitBreaker,
    state: Mutex<TargetState>,
    // One permit per connection sitting in the ready queue.
    ready_slots: Semaphore,
}

struct TargetState {
    ready: VecDeque<PooledConn>,
    total: usize,
    closed: bool,
}

struct PooledConn {
    channel: Channel,
    unhealthy: Arc<AtomicBool>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl PooledConn {
    fn close(&self) {
        self.supervisor.abort();
    }
}

impl TargetPool {
    fn new(core: Arc<PoolCore>, target: Target) -> Arc<Self> {
        Arc::new(Self {
            core,
            id: target.id.clone(),
            target: Mutex::new(target),
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
            state: Mutex::new(TargetState {
                ready: VecDeque::new(),
                total: 0,
                closed: false,
            }),
            ready_slots: Semaphore::new(0),
        })
    }

    fn update_target(&self, target: Target) {
        let mut current = self.target.lock();
        if target.id == current.id {
            *current = target;
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn total(&self) -> usize {
        self.state.lock().total
    }

    async fn acquire(self: Arc<Self>) -> Result<Lease, PoolError> {
        if !self.breaker.allow() {
            return Err(PoolError::PoolDraining);
        }
        let cfg = self.core.config();
        let start = Instant::now();
        match tokio::time::timeout(cfg.acquire_timeout, self.acquire_inner()).await {
            Ok(Ok(lease)) => {
                self.core.metrics.observe_acquire(&self.id, start.elapsed());
                Ok(lease)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PoolError::AcquireTimeout),
        }
    }

    async fn acquire_inner(self: &Arc<Self>) -> Result<Lease, PoolError> {
        loop {
            if let Some(conn) = self.try_take_ready() {
                if let Some(conn) = self.vet(conn) {
                    return Ok(self.lease(conn));
                }
                continue;
            }
            if self.is_closed() {
                return Err(PoolError::PoolDraining);
            }
            match self.maybe_open().await {
                // A connection was pushed; loop back and race to take it.
                Ok(true) => continue,
                // At capacity: fall through and wait for a release.
                Ok(false) => {}
                Err(PoolError::Closed) => return Err(PoolError::PoolDraining),
                Err(err) => {
                    warn!(enclave = %self.id, error = %err, "open connection failed");
                }
            }
            match self.ready_slots.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    let conn = self.state.lock().ready.pop_front();
                    if let Some(conn) = conn {
                        if let Some(conn) = self.vet(conn) {
                            return Ok(self.lease(conn));
                        }
                    }
                }
                // Semaphore closed: the target was drained or removed.
                Err(_) => return Err(PoolError::PoolDraining),
            }
        }
    }

    /// Take a ready connection without waiting.
    fn try_take_ready(&self) -> Option<PooledConn> {
        let permit = self.ready_slots.try_acquire().ok()?;
        permit.forget();
        self.state.lock().ready.pop_front()
    }

    /// Discard unhealthy connections, scheduling a background replacement.
    fn vet(self: &Arc<Self>, conn: PooledConn) -> Option<PooledConn> {
        if conn.unhealthy.load(Ordering::SeqCst) {
            conn.close();
            self.decrement();
            self.spawn_background_open();
            return None;
        }
        Some(conn)
    }

    fn lease(self: &Arc<Self>, conn: PooledConn) -> Lease {
        Lease {
            conn: Some(conn),
            target: Arc::clone(self),
        }
    }

    /// Open one connection if the target is below `max_conns`. Returns
    /// `Ok(true)` when a connection was opened and pushed to the ready
    /// queue.
    async fn maybe_open(self: &Arc<Self>) -> Result<bool, PoolError> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(PoolError::Closed);
            }
            if st.total >= self.core.config().max_conns {
                return Ok(false);
            }
            st.total += 1;
        }
        match self.open_connection().await {
            Ok(conn) => {
                self.publish_total();
                self.push_ready(conn);
                Ok(true)
            }
            Err(err) => {
                self.decrement();
                Err(err)
            }
        }
    }

    async fn open_connection(self: &Arc<Self>) -> Result<PooledConn, PoolError> {
        let cfg = self.core.config();
        let target = self.target.lock().clone();
        let channel = self.core.dialer.dial(&target, &cfg).await?;
        Ok(self.supervise(channel))
    }

    /// Attach the per-connection supervisor: a periodic probe of the
    /// standard health service with a timeout equal to the acquire timeout.
    /// Probe failures mark the connection unhealthy, tick the breaker, and
    /// back off before probing again; successes reset the backoff and record
    /// a breaker success. The channel itself re-establishes transport
    /// connectivity internally.
    fn supervise(self: &Arc<Self>, channel: Channel) -> PooledConn {
        let unhealthy = Arc::new(AtomicBool::new(false));
        let this = Arc::clone(self);
        let flag = Arc::clone(&unhealthy);
        let mut health = HealthClient::new(channel.clone());
        let mut shutdown = self.core.shutdown.subscribe();
        let supervisor = tokio::spawn(async move {
            let mut backoff = Backoff::new(this.core.config().backoff);
            loop {
                let cfg = this.core.config();
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(cfg.health_check_interval) => {}
                }
                let request = HealthCheckRequest {
                    service: cfg.service_name.clone(),
                };
                let serving = match tokio::time::timeout(
                    cfg.acquire_timeout,
                    health.check(request),
                )
                .await
                {
                    Ok(Ok(resp)) => resp.into_inner().status == ServingStatus::Serving as i32,
                    Ok(Err(_)) | Err(_) => false,
                };
                if serving {
                    backoff.reset();
                    this.breaker.success();
                } else {
                    flag.store(true, Ordering::SeqCst);
                    this.core.metrics.inc_stream_reset(&this.id);
                    this.breaker.failure();
                    warn!(enclave = %this.id, "enclave health probe degraded");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(backoff.next()) => {}
                    }
                }
            }
        });
        PooledConn {
            channel,
            unhealthy,
            supervisor,
        }
    }

    fn push_ready(self: &Arc<Self>, conn: PooledConn) {
        {
            let mut st = self.state.lock();
            let max = self.core.config().max_conns;
            if !st.closed && st.ready.len() < max {
                st.ready.push_back(conn);
                drop(st);
                self.ready_slots.add_permits(1);
                return;
            }
        }
        conn.close();
        self.decrement();
    }

    /// Return a borrowed connection. An error outcome counts as a stream
    /// reset: the connection is closed and replaced in the background.
    fn release(self: &Arc<Self>, conn: PooledConn, failed: bool) {
        if failed {
            conn.unhealthy.store(true, Ordering::SeqCst);
            self.core.metrics.inc_stream_reset(&self.id);
            self.breaker.failure();
        }
        if conn.unhealthy.load(Ordering::SeqCst) {
            conn.close();
            self.decrement();
            self.spawn_background_open();
            return;
        }
        self.push_ready(conn);
    }

    fn decrement(&self) {
        {
            let mut st = self.state.lock();
            st.total = st.total.saturating_sub(1);
        }
        self.publish_total();
    }

    fn publish_total(&self) {
        let total = self.total();
        self.core.metrics.set_active(&self.id, total as i64);
    }

    fn spawn_background_open(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.maybe_open().await {
                debug!(enclave = %this.id, error = %err, "background reopen failed");
            }
        });
    }

    /// Re-open connections with backoff until the target reaches
    /// `min_conns`, the pool shuts down, or the target closes.
    fn spawn_warmer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.core.shutdown.subscribe();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(this.core.config().backoff);
            loop {
                if *shutdown.borrow() || this.is_closed() {
                    return;
                }
                if this.total() >= this.core.config().min_conns {
                    return;
                }
                match this.maybe_open().await {
                    Ok(_) => backoff.reset(),
                    Err(PoolError::Closed) => return,
                    Err(err) => {
                        warn!(enclave = %this.id, error = %err, "prewarm connection failed");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(backoff.next()) => {}
                        }
                    }
                }
            }
        });
    }

    /// Close surplus ready connections after a capacity shrink.
    fn trim_ready(self: &Arc<Self>) {
        let max = self.core.config().max_conns;
        loop {
            {
                let st = self.state.lock();
                if st.closed || st.ready.len() <= max {
                    return;
                }
            }
            let Ok(permit) = self.ready_slots.try_acquire() else {
                return;
            };
            permit.forget();
            let conn = self.state.lock().ready.pop_back();
            match conn {
                Some(conn) => {
                    conn.close();
                    self.decrement();
                }
                None => return,
            }
        }
    }

    fn drain(&self) {
        self.breaker.drain();
        self.close();
    }

    fn close(&self) {
        let conns: Vec<PooledConn> = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.total = 0;
            st.ready.drain(..).collect()
        };
        self.ready_slots.close();
        for conn in conns {
            conn.close();
        }
        self.core.metrics.set_active(&self.id, 0);
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// One-shot borrow of a pooled connection. Dropping the lease returns the
/// connection as healthy; releasing with an error outcome classifies it as
/// unhealthy, closing it instead of reusing it.
pub struct Lease {
    conn: Option<PooledConn>,
    target: Arc<TargetPool>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

impl Lease {
    /// The underlying channel.
    pub fn channel(&self) -> Channel {
        match &self.conn {
            Some(conn) => conn.channel.clone(),
            // `release` consumes the lease, so the slot is always populated.
            None => unreachable!("lease accessed after release"),
        }
    }

    /// A signer RPC client over the leased channel.
    pub fn client(&self) -> SignerClient {
        SignerClient::new(self.channel())
    }

    /// Return the connection, classifying it by the caller's outcome.
    pub fn release<T, E>(mut self, outcome: &Result<T, E>) {
        if let Some(conn) = self.conn.take() {
            self.target.release(conn, outcome.is_err());
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.target.release(conn, false);
        }
    }
}
