//! Per-key cache entry and its state machine.
//!
//! Every externally observable failure from [`KeyEntry::checkout`] is
//! `UNLOCK_REQUIRED`, carrying a reason and the refresh budget so the unlock
//! responder can size the client retry hint.
//!
//! # Locking
//!
//! The entry lock covers all mutable state and is only held for microsecond
//! critical sections; rehydration always runs with the lock released, under
//! the single-flight refresh scheduler.
//!
//! # Security invariants
//!
//! - The plaintext slot is zeroed under the entry lock whenever the entry
//!   leaves `Warm`, with writes that cannot be optimized out.
//! - The ciphertext blob is a defensive copy made at construction.
//! - Checkout hands out an owned [`PlainKey`] copy that zeroes itself on drop.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use signer_common::{ApiError, ApiResult, ErrorKind};
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::util::clock::{system_clock, Clock};

use super::dek::KEY_LEN;
use super::metrics::CacheMetrics;
use super::refresh::{DirectScheduler, RefreshScheduler, RefreshTask};
use super::rehydrate::{NoopRehydrator, Rehydrator};
use super::state::KeyState;

pub const DEFAULT_LOW_WATER: u32 = 50_000;
pub const DEFAULT_MAX_USES: u32 = 1_000_000;
pub const DEFAULT_SOFT_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_HARD_TTL: Duration = Duration::from_secs(16 * 60);
pub const DEFAULT_DEK_VALID_FOR: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REFRESH_BUDGET: Duration = Duration::from_millis(3);

/// Owned copy of a plaintext key. Zeroes itself on drop; `Debug` is redacted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PlainKey([u8; KEY_LEN]);

impl PlainKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for PlainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlainKey([REDACTED])")
    }
}

/// Result of a successful checkout.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub key_id: String,
    pub state: KeyState,
    pub plain_key: PlainKey,
    pub has_plain: bool,
}

/// Construction parameters for a [`KeyEntry`]. Zero-valued fields take the
/// documented defaults; absent collaborators take no-op implementations.
#[derive(Default)]
pub struct EntryConfig {
    pub key_id: String,
    pub enclave: String,
    pub keyspace: String,

    /// `Some` constructs the entry warm; `None` constructs it cool.
    pub plain_key: Option<[u8; KEY_LEN]>,
    /// Ciphertext blob used as input to local rehydration. Copied at ingest.
    pub cipher_blob: Vec<u8>,
    pub uses_left: u32,
    pub max_uses: u32,
    pub low_water: u32,

    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub dek_valid_for: Duration,
    pub refresh_budget: Duration,
    pub created_at: Option<SystemTime>,

    pub clock: Option<Arc<dyn Clock>>,
    pub metrics: Option<Arc<CacheMetrics>>,
    pub rehydrator: Option<Arc<dyn Rehydrator>>,
    pub refresher: Option<Arc<dyn RefreshScheduler>>,
}

/// One cached key.
pub struct KeyEntry {
    key_id: String,
    enclave: String,
    keyspace: String,

    cipher_blob: Vec<u8>,

    soft_window: Duration,
    hard_window: Duration,
    max_uses: u32,
    low_water: u32,
    refresh_budget: Duration,

    clock: Arc<dyn Clock>,
    metrics: Arc<CacheMetrics>,
    rehydrator: Arc<dyn Rehydrator>,
    refresher: Arc<dyn RefreshScheduler>,

    slots: Mutex<EntrySlots>,
}

struct EntrySlots {
    plain: [u8; KEY_LEN],
    has_plain: bool,
    uses_left: u32,
    soft_ttl: SystemTime,
    hard_ttl: SystemTime,
    dek_valid_until: SystemTime,
    state: KeyState,
}

enum Decision {
    Ready { result: Checkout, background: bool },
    Refresh,
}

impl KeyEntry {
    /// Validate `cfg`, apply defaults, and build the entry.
    pub fn new(mut cfg: EntryConfig) -> ApiResult<Arc<Self>> {
        if cfg.key_id.is_empty() {
            return Err(ApiError::new(ErrorKind::InvalidArgument, "key id is required"));
        }
        if cfg.enclave.is_empty() {
            return Err(ApiError::new(
                ErrorKind::InvalidArgument,
                "enclave label is required",
            ));
        }
        if cfg.keyspace.is_empty() {
            return Err(ApiError::new(ErrorKind::InvalidArgument, "keyspace is required"));
        }
        if cfg.soft_ttl.is_zero() {
            cfg.soft_ttl = DEFAULT_SOFT_TTL;
        }
        if cfg.hard_ttl.is_zero() {
            cfg.hard_ttl = DEFAULT_HARD_TTL;
        }
        if cfg.dek_valid_for.is_zero() {
            cfg.dek_valid_for = DEFAULT_DEK_VALID_FOR;
        }
        if cfg.refresh_budget.is_zero() {
            cfg.refresh_budget = DEFAULT_REFRESH_BUDGET;
        }
        if cfg.max_uses == 0 {
            cfg.max_uses = DEFAULT_MAX_USES;
        }
        if cfg.uses_left == 0 || cfg.uses_left > cfg.max_uses {
            cfg.uses_left = cfg.max_uses;
        }
        if cfg.low_water == 0 {
            cfg.low_water = DEFAULT_LOW_WATER;
        }
        let clock = cfg.clock.unwrap_or_else(system_clock);
        let metrics = cfg
            .metrics
            .unwrap_or_else(|| Arc::new(CacheMetrics::unregistered()));
        let rehydrator = cfg.rehydrator.unwrap_or_else(|| Arc::new(NoopRehydrator));
        let refresher = cfg
            .refresher
            .unwrap_or_else(|| Arc::new(DirectScheduler));
        let created_at = cfg.created_at.unwrap_or_else(|| clock.now());

        let (plain, has_plain, state, uses_left) = match cfg.plain_key {
            Some(plain) => (plain, true, KeyState::Warm, cfg.uses_left),
            None => ([0u8; KEY_LEN], false, KeyState::Cool, 0),
        };

        let entry = Self {
            key_id: cfg.key_id,
            enclave: cfg.enclave,
            keyspace: cfg.keyspace,
            cipher_blob: cfg.cipher_blob,
            soft_window: cfg.soft_ttl,
            hard_window: cfg.hard_ttl,
            max_uses: cfg.max_uses,
            low_water: cfg.low_water,
            refresh_budget: cfg.refresh_budget,
            clock,
            metrics,
            rehydrator,
            refresher,
            slots: Mutex::new(EntrySlots {
                plain,
                has_plain,
                uses_left,
                soft_ttl: created_at + cfg.soft_ttl,
                hard_ttl: created_at + cfg.hard_ttl,
                dek_valid_until: created_at + cfg.dek_valid_for,
                state,
            }),
        };
        entry.metrics.update_state(&entry.enclave, None, state);
        Ok(Arc::new(entry))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn enclave(&self) -> &str {
        &self.enclave
    }

    pub fn state(&self) -> KeyState {
        self.slots.lock().state
    }

    pub fn uses_left(&self) -> u32 {
        self.slots.lock().uses_left
    }

    /// Perform the pre-signing checkout: validate freshness, decrement the
    /// use budget, and hand out an owned plaintext copy.
    ///
    /// Loops until a decisive outcome: either a warm checkout or an
    /// `UNLOCK_REQUIRED` failure. Slow work (rehydration) happens under the
    /// refresh scheduler with the entry lock released, bounded by the
    /// entry's refresh budget.
    pub async fn checkout(self: &Arc<Self>) -> ApiResult<Checkout> {
        loop {
            match self.try_checkout()? {
                Decision::Ready { result, background } => {
                    if background {
                        self.refresher
                            .spawn(&self.keyspace, &self.key_id, self.refresh_task());
                    }
                    return Ok(result);
                }
                Decision::Refresh => {
                    self.refresher
                        .run(
                            &self.keyspace,
                            &self.key_id,
                            self.refresh_budget,
                            self.refresh_task(),
                        )
                        .await?;
                }
            }
        }
    }

    fn try_checkout(&self) -> ApiResult<Decision> {
        let mut slots = self.slots.lock();
        let now = self.clock.now();

        if now > slots.dek_valid_until {
            self.to_invalid_locked(&mut slots, "dek expired");
            return Err(ApiError::unlock_required("dek expired", self.refresh_budget));
        }
        if slots.state == KeyState::Invalid {
            return Err(ApiError::unlock_required("key invalid", self.refresh_budget));
        }
        if !slots.has_plain || now > slots.hard_ttl || slots.uses_left == 0 {
            return Ok(Decision::Refresh);
        }

        slots.uses_left -= 1;
        let result = Checkout {
            key_id: self.key_id.clone(),
            state: KeyState::Warm,
            plain_key: PlainKey(slots.plain),
            has_plain: true,
        };

        // Low-water scheduling is meaningless when the budget never rises
        // above the mark.
        let low_water = if self.max_uses <= self.low_water {
            0
        } else {
            self.low_water
        };
        let background =
            (low_water > 0 && slots.uses_left <= low_water) || now > slots.soft_ttl;

        Ok(Decision::Ready { result, background })
    }

    /// Produce the single refresh task for this entry, to be run under the
    /// refresh scheduler's per-key coalescing.
    pub(crate) fn refresh_task(self: &Arc<Self>) -> RefreshTask {
        let entry = Arc::clone(self);
        Box::pin(async move { entry.refresh_once().await })
    }

    async fn refresh_once(self: Arc<Self>) -> ApiResult<()> {
        {
            let mut slots = self.slots.lock();
            let now = self.clock.now();
            if now > slots.dek_valid_until {
                self.to_invalid_locked(&mut slots, "dek expired");
                return Err(ApiError::unlock_required("dek expired", self.refresh_budget));
            }
            if slots.state == KeyState::Invalid {
                return Err(ApiError::unlock_required("key invalid", self.refresh_budget));
            }
            let need_cool = !slots.has_plain || now > slots.hard_ttl || slots.uses_left == 0;
            if !need_cool && now < slots.soft_ttl && slots.uses_left > 0 {
                // A racing caller already refreshed this entry.
                return Ok(());
            }
            if need_cool {
                self.to_cool_locked(&mut slots, "hard ttl reached");
            }
        }

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            self.refresh_budget,
            self.rehydrator.rehydrate(&self.key_id, &self.cipher_blob),
        )
        .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut plain = match outcome {
            Ok(Ok(plain)) => plain,
            Ok(Err(err)) => {
                return Err(self.fail_rehydrate(elapsed_ms, &format!("rehydrate failed: {err}")));
            }
            Err(_) => {
                return Err(self.fail_rehydrate(elapsed_ms, "rehydrate failed: budget exceeded"));
            }
        };
        self.metrics
            .observe_rehydrate(&self.keyspace, elapsed_ms, true);

        let mut slots = self.slots.lock();
        let now = self.clock.now();
        slots.plain = plain;
        plain.zeroize();
        slots.has_plain = true;
        slots.uses_left = self.max_uses;
        slots.soft_ttl = now + self.soft_window;
        slots.hard_ttl = now + self.hard_window;
        let from = slots.state;
        self.transition_locked(&mut slots, from, KeyState::Warm);
        Ok(())
    }

    fn fail_rehydrate(&self, elapsed_ms: f64, reason: &str) -> ApiError {
        self.metrics
            .observe_rehydrate(&self.keyspace, elapsed_ms, false);
        self.metrics.inc_hard_expired(&self.keyspace);
        let mut slots = self.slots.lock();
        self.to_invalid_locked(&mut slots, reason);
        ApiError::unlock_required("rehydrate failed", self.refresh_budget)
    }

    /// Whether the prefetcher should schedule a background refresh for this
    /// entry. `low_water == 0` falls back to the entry's own mark.
    pub(crate) fn should_prefetch(
        &self,
        now: SystemTime,
        refresh_window: Duration,
        low_water: u32,
    ) -> bool {
        let slots = self.slots.lock();
        if slots.state != KeyState::Warm {
            return false;
        }
        let low_water = if low_water > 0 { low_water } else { self.low_water };
        if slots.uses_left < low_water {
            return true;
        }
        match slots.soft_ttl.checked_sub(refresh_window) {
            Some(threshold) => now > threshold,
            None => true,
        }
    }

    fn to_cool_locked(&self, slots: &mut EntrySlots, reason: &str) {
        if slots.state == KeyState::Cool {
            return;
        }
        info!(key = %self.key_id, reason, "key cache entry entering COOL");
        self.clear_plain_locked(slots);
        let from = slots.state;
        self.transition_locked(slots, from, KeyState::Cool);
    }

    fn to_invalid_locked(&self, slots: &mut EntrySlots, reason: &str) {
        if slots.state == KeyState::Invalid {
            return;
        }
        warn!(key = %self.key_id, reason, "key cache entry invalid");
        self.clear_plain_locked(slots);
        let from = slots.state;
        self.transition_locked(slots, from, KeyState::Invalid);
    }

    fn transition_locked(&self, slots: &mut EntrySlots, from: KeyState, to: KeyState) {
        if from == to {
            return;
        }
        self.metrics.update_state(&self.enclave, Some(from), to);
        slots.state = to;
    }

    fn clear_plain_locked(&self, slots: &mut EntrySlots) {
        slots.plain.zeroize();
        slots.has_plain = false;
        slots.uses_left = 0;
    }
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("key_id", &self.key_id)
            .field("enclave", &self.enclave)
            .field("keyspace", &self.keyspace)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::testing::*;
    use super::*;
    use crate::keycache::dek::{seal_key_blob, DekStore};
    use crate::keycache::refresh::RefreshGroup;
    use crate::keycache::rehydrate::DekRehydrator;
    use crate::keycache::unlock::{NoopNotifier, UnlockOutcome};
    use crate::unlock::{Dispatcher, UnlockConfig, UnlockExecutor, UnlockJob, UnlockMetrics};
    use crate::util::clock::FakeClock;

    fn entry_config(key_id: &str) -> EntryConfig {
        EntryConfig {
            key_id: key_id.into(),
            enclave: "enc".into(),
            keyspace: "prod".into(),
            cipher_blob: b"cipher".to_vec(),
            soft_ttl: Duration::from_secs(60),
            hard_ttl: Duration::from_secs(120),
            dek_valid_for: Duration::from_secs(3600),
            ..EntryConfig::default()
        }
    }

    #[tokio::test]
    async fn warm_checkout_decrements_uses() {
        let clock = Arc::new(FakeClock::epoch());
        let mut cfg = entry_config("key-1");
        cfg.plain_key = Some(fixed_plain(0xAA));
        cfg.uses_left = 10;
        cfg.max_uses = 10;
        cfg.clock = Some(clock);
        let entry = KeyEntry::new(cfg).unwrap();

        let result = entry.checkout().await.unwrap();
        assert_eq!(result.plain_key.as_bytes(), &fixed_plain(0xAA));
        assert!(result.has_plain);
        assert_eq!(result.state, KeyState::Warm);
        assert_eq!(entry.uses_left(), 9);
        assert_eq!(entry.state(), KeyState::Warm);
    }

    #[tokio::test]
    async fn soft_ttl_schedules_exactly_one_background_refresh() {
        let clock = Arc::new(FakeClock::epoch());
        let sched = Arc::new(RecordingScheduler::default());
        let mut cfg = entry_config("key-soft");
        cfg.plain_key = Some(fixed_plain(0x01));
        cfg.uses_left = 100;
        cfg.max_uses = 100;
        cfg.soft_ttl = Duration::from_millis(1);
        cfg.hard_ttl = Duration::from_secs(1);
        cfg.clock = Some(clock.clone());
        cfg.refresher = Some(sched.clone());
        let entry = KeyEntry::new(cfg).unwrap();

        clock.advance(Duration::from_millis(2));
        entry.checkout().await.unwrap();
        assert_eq!(sched.spawn_calls(), 1);
    }

    #[tokio::test]
    async fn hard_ttl_rehydrates_synchronously() {
        let clock = Arc::new(FakeClock::epoch());
        let stub = Arc::new(StubRehydrator::returning(fixed_plain(0xBB)));
        let mut cfg = entry_config("key-hard");
        cfg.plain_key = Some(fixed_plain(0x02));
        cfg.uses_left = 1;
        cfg.max_uses = 4;
        cfg.soft_ttl = Duration::from_millis(1);
        cfg.hard_ttl = Duration::from_millis(2);
        cfg.dek_valid_for = Duration::from_secs(60);
        cfg.clock = Some(clock.clone());
        cfg.rehydrator = Some(stub.clone());
        let entry = KeyEntry::new(cfg).unwrap();

        clock.advance(Duration::from_millis(5));
        let result = entry.checkout().await.unwrap();
        assert_eq!(result.plain_key.as_bytes(), &fixed_plain(0xBB));
        assert_eq!(entry.uses_left(), 3);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn uses_exhaustion_triggers_refresh_on_next_call() {
        let clock = Arc::new(FakeClock::epoch());
        let stub = Arc::new(StubRehydrator::returning(fixed_plain(0x0C)));
        let mut cfg = entry_config("key-uses");
        cfg.plain_key = Some(fixed_plain(0x0B));
        cfg.uses_left = 1;
        cfg.max_uses = 8;
        cfg.clock = Some(clock);
        cfg.rehydrator = Some(stub.clone());
        let entry = KeyEntry::new(cfg).unwrap();

        entry.checkout().await.unwrap();
        assert_eq!(entry.uses_left(), 0);
        let result = entry.checkout().await.unwrap();
        assert_eq!(result.plain_key.as_bytes(), &fixed_plain(0x0C));
        assert_eq!(stub.calls(), 1);
        assert_eq!(entry.uses_left(), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_cool_checkouts_rehydrate_once() {
        let clock = Arc::new(FakeClock::epoch());
        let metrics = Arc::new(CacheMetrics::unregistered());
        let group = RefreshGroup::new(metrics.clone(), Arc::new(NoopNotifier));
        let stub = Arc::new(StubRehydrator::returning(fixed_plain(0xCC)));
        let mut cfg = entry_config("key-sf");
        cfg.refresh_budget = Duration::from_millis(500);
        cfg.clock = Some(clock);
        cfg.metrics = Some(metrics);
        cfg.rehydrator = Some(stub.clone());
        cfg.refresher = Some(Arc::new(group));
        let entry = KeyEntry::new(cfg).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let entry = Arc::clone(&entry);
            handles.push(tokio::spawn(async move { entry.checkout().await }));
        }
        for h in handles {
            let result = h.await.unwrap().unwrap();
            assert_eq!(result.plain_key.as_bytes(), &fixed_plain(0xCC));
        }
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_rehydrate_times_out_both_callers() {
        let clock = Arc::new(FakeClock::epoch());
        let metrics = Arc::new(CacheMetrics::unregistered());
        let group = RefreshGroup::new(metrics.clone(), Arc::new(NoopNotifier));
        let slow = Arc::new(SlowRehydrator::new(Duration::from_millis(50)));
        let mut cfg = entry_config("key-timeout");
        cfg.refresh_budget = Duration::from_millis(3);
        cfg.clock = Some(clock);
        cfg.metrics = Some(metrics.clone());
        cfg.rehydrator = Some(slow.clone());
        cfg.refresher = Some(Arc::new(group));
        let entry = KeyEntry::new(cfg).unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let entry = Arc::clone(&entry);
            handles.push(tokio::spawn(async move { entry.checkout().await }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnlockRequired);
        }
        assert_eq!(slow.calls(), 1);
        assert!(metrics.wait_timeouts("prod") >= 1.0);
    }

    #[tokio::test]
    async fn rehydrate_failure_marks_invalid() {
        let clock = Arc::new(FakeClock::epoch());
        let metrics = Arc::new(CacheMetrics::unregistered());
        let stub = Arc::new(StubRehydrator::failing());
        let mut cfg = entry_config("key-fail");
        cfg.clock = Some(clock);
        cfg.metrics = Some(metrics.clone());
        cfg.rehydrator = Some(stub);
        let entry = KeyEntry::new(cfg).unwrap();

        let err = entry.checkout().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnlockRequired);
        assert!(err.to_string().contains("rehydrate failed"));
        assert_eq!(entry.state(), KeyState::Invalid);
        assert_eq!(metrics.hard_expired("prod"), 1.0);
        assert_eq!(metrics.rehydrate_failures("prod"), 1.0);

        // Terminal until an external unlock re-seeds the entry.
        let err = entry.checkout().await.unwrap_err();
        assert!(err.to_string().contains("key invalid"));
    }

    #[tokio::test]
    async fn dek_expiry_always_reports_dek_expired() {
        let clock = Arc::new(FakeClock::epoch());
        let mut cfg = entry_config("key-dek");
        cfg.plain_key = Some(fixed_plain(0x03));
        cfg.dek_valid_for = Duration::from_millis(10);
        cfg.clock = Some(clock.clone());
        let entry = KeyEntry::new(cfg).unwrap();

        clock.advance(Duration::from_millis(20));
        for _ in 0..3 {
            let err = entry.checkout().await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnlockRequired);
            assert!(err.to_string().contains("dek expired"));
        }
        assert_eq!(entry.state(), KeyState::Invalid);
    }

    #[tokio::test]
    async fn cipher_blob_is_a_defensive_copy() {
        let clock = Arc::new(FakeClock::epoch());
        let stub = Arc::new(StubRehydrator::returning(fixed_plain(0x33)));
        let mut blob = b"cipher-orig".to_vec();
        let mut cfg = entry_config("key-blob");
        cfg.cipher_blob = blob.clone();
        cfg.clock = Some(clock);
        cfg.rehydrator = Some(stub.clone());
        let entry = KeyEntry::new(cfg).unwrap();

        blob[0] = b'x';
        entry.checkout().await.unwrap();
        assert_eq!(stub.last_blob(), b"cipher-orig".to_vec());
    }

    #[tokio::test]
    async fn plain_slot_zeroed_outside_warm() {
        let clock = Arc::new(FakeClock::epoch());
        let stub = Arc::new(StubRehydrator::failing());
        let mut cfg = entry_config("key-zero");
        cfg.plain_key = Some(fixed_plain(0x44));
        cfg.hard_ttl = Duration::from_millis(1);
        cfg.soft_ttl = Duration::from_millis(1);
        cfg.clock = Some(clock.clone());
        cfg.rehydrator = Some(stub);
        let entry = KeyEntry::new(cfg).unwrap();

        clock.advance(Duration::from_millis(5));
        let _ = entry.checkout().await;
        let slots = entry.slots.lock();
        assert_ne!(slots.state, KeyState::Warm);
        assert!(slots.plain.iter().all(|&b| b == 0));
        assert!(!slots.has_plain);
        assert_eq!(slots.uses_left, 0);
    }

    #[tokio::test]
    async fn exactly_at_ttl_boundaries_do_not_refresh() {
        // `now == soft_ttl` and `now == hard_ttl` are still fresh; only
        // strictly-after triggers refresh work.
        let clock = Arc::new(FakeClock::epoch());
        let sched = Arc::new(RecordingScheduler::default());
        let mut cfg = entry_config("key-boundary");
        cfg.plain_key = Some(fixed_plain(0x05));
        cfg.uses_left = 10;
        cfg.max_uses = 10;
        cfg.soft_ttl = Duration::from_millis(5);
        cfg.hard_ttl = Duration::from_millis(5);
        cfg.clock = Some(clock.clone());
        cfg.refresher = Some(sched.clone());
        let entry = KeyEntry::new(cfg).unwrap();

        clock.advance(Duration::from_millis(5));
        let result = entry.checkout().await.unwrap();
        assert_eq!(result.state, KeyState::Warm);
        assert_eq!(sched.spawn_calls(), 0);
    }

    #[test]
    fn construction_requires_identity() {
        assert!(KeyEntry::new(EntryConfig::default()).is_err());
        let mut cfg = entry_config("k");
        cfg.enclave = String::new();
        assert!(KeyEntry::new(cfg).is_err());
    }

    #[test]
    fn plain_key_debug_is_redacted() {
        let key = PlainKey(fixed_plain(0x77));
        assert!(format!("{key:?}").contains("REDACTED"));
    }

    struct CountingExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl UnlockExecutor for CountingExecutor {
        async fn execute(&self, job: UnlockJob) -> UnlockOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
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

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_rehydration_escalates_one_unlock_event() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(
            UnlockConfig {
                workers: 2,
                backoff_base: Duration::from_millis(5),
                backoff_max: Duration::from_millis(20),
                ..UnlockConfig::default()
            },
            executor.clone(),
            Arc::new(UnlockMetrics::unregistered()),
        );
        let metrics = Arc::new(CacheMetrics::unregistered());
        let group = RefreshGroup::new(metrics.clone(), Arc::new(dispatcher.clone()));

        let mut cfg = entry_config("hot-key");
        cfg.refresh_budget = Duration::from_millis(200);
        cfg.clock = Some(Arc::new(FakeClock::epoch()));
        cfg.metrics = Some(metrics);
        cfg.rehydrator = Some(Arc::new(StubRehydrator::failing()));
        cfg.refresher = Some(Arc::new(group));
        let entry = KeyEntry::new(cfg).unwrap();

        // Four concurrent checkouts coalesce into one refresh, which fails
        // and must escalate exactly one unlock event.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let entry = Arc::clone(&entry);
            handles.push(tokio::spawn(async move { entry.checkout().await }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnlockRequired);
        }
        assert_eq!(entry.state(), KeyState::Invalid);

        wait_for(|| dispatcher.pending() == 0).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dek_rehydration_completes_warm_cool_warm_cycle() {
        let clock = Arc::new(FakeClock::epoch());
        let store = DekStore::new();
        let dek = [0x11u8; KEY_LEN];
        store.store("prod", &dek).await.unwrap();

        let original = fixed_plain(0xAA);
        let rotated = fixed_plain(0xBB);
        let mut cfg = entry_config("cycled");
        cfg.plain_key = Some(original);
        cfg.cipher_blob = seal_key_blob(&dek, &rotated).unwrap();
        cfg.uses_left = 4;
        cfg.max_uses = 4;
        cfg.soft_ttl = Duration::from_millis(10);
        cfg.hard_ttl = Duration::from_millis(20);
        cfg.refresh_budget = Duration::from_millis(200);
        cfg.clock = Some(clock.clone());
        cfg.rehydrator = Some(Arc::new(DekRehydrator::new(store.clone(), "prod")));
        let entry = KeyEntry::new(cfg).unwrap();

        // Warm: the original plaintext is served.
        let checkout = entry.checkout().await.unwrap();
        assert_eq!(checkout.plain_key.as_bytes(), &original);

        // Past the hard TTL the entry cools and rehydrates from the blob.
        clock.advance(Duration::from_millis(30));
        let checkout = entry.checkout().await.unwrap();
        assert_eq!(checkout.plain_key.as_bytes(), &rotated);
        assert_eq!(entry.state(), KeyState::Warm);
        assert_eq!(entry.uses_left(), 3);

        // Without the DEK the next hard expiry is unrecoverable locally.
        store.remove("prod").await;
        clock.advance(Duration::from_millis(30));
        let err = entry.checkout().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnlockRequired);
        assert_eq!(entry.state(), KeyState::Invalid);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn uses_left_decreases_until_refresh_resets(
                max_uses in 2u32..10,
                checkouts in 1usize..30,
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap();
                rt.block_on(async move {
                    let mut cfg = entry_config("key-counter");
                    cfg.plain_key = Some(fixed_plain(0xAA));
                    cfg.max_uses = max_uses;
                    cfg.soft_ttl = Duration::from_secs(3600);
                    cfg.hard_ttl = Duration::from_secs(7200);
                    cfg.dek_valid_for = Duration::from_secs(36_000);
                    cfg.refresh_budget = Duration::from_millis(100);
                    cfg.clock = Some(Arc::new(FakeClock::epoch()));
                    cfg.rehydrator = Some(Arc::new(StubRehydrator::returning(fixed_plain(0xBB))));
                    let entry = KeyEntry::new(cfg).unwrap();

                    let mut prev = entry.uses_left();
                    assert_eq!(prev, max_uses);
                    for _ in 0..checkouts {
                        entry.checkout().await.unwrap();
                        let now = entry.uses_left();
                        // Monotonic decrease, except when an exhaustion-
                        // triggered refresh resets the budget to max_uses
                        // (then minus the checkout that consumed it).
                        assert!(
                            now + 1 == prev || now + 1 == max_uses,
                            "uses_left jumped from {prev} to {now} (max {max_uses})"
                        );
                        prev = now;
                    }
                });
            }
        }
    }
}
