//! Prometheus metrics for the key cache: state gauge, rehydrate latency,
//! single-flight waiters, and prefetcher counters.

use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use super::state::KeyState;

/// Metric family bundle for the key cache. Cheap to clone via `Arc`.
pub struct CacheMetrics {
    state_gauge: IntGaugeVec,
    hard_expired_rejections: CounterVec,
    rehydrate_latency: HistogramVec,
    rehydrate_total: CounterVec,
    rehydrate_failures: CounterVec,
    singleflight_waiters: IntGaugeVec,
    singleflight_timeouts: CounterVec,
    prefetch_scans: Counter,
    prefetch_skipped: Counter,
    prefetch_triggers: CounterVec,
}

impl CacheMetrics {
    /// Build and register all key cache collectors in `reg`.
    pub fn new(reg: &Registry) -> prometheus::Result<Self> {
        let state_gauge = IntGaugeVec::new(
            Opts::new("key_cache_state", "Number of key cache entries in each state"),
            &["enclave", "state"],
        )?;
        let hard_expired_rejections = CounterVec::new(
            Opts::new(
                "hard_expired_rejections_total",
                "Number of requests rejected due to hard expiration",
            ),
            &["keyspace"],
        )?;
        let rehydrate_latency = HistogramVec::new(
            HistogramOpts::new(
                "rehydrate_latency_ms",
                "Latency of local rehydrate operations (milliseconds)",
            )
            .buckets(vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 3.0, 5.0, 7.5, 10.0]),
            &["keyspace"],
        )?;
        let rehydrate_total = CounterVec::new(
            Opts::new("rehydrate_total", "Number of local rehydrate attempts"),
            &["keyspace"],
        )?;
        let rehydrate_failures = CounterVec::new(
            Opts::new("rehydrate_fail_total", "Number of failed local rehydrate attempts"),
            &["keyspace"],
        )?;
        let singleflight_waiters = IntGaugeVec::new(
            Opts::new(
                "singleflight_waiters",
                "Number of tasks waiting on key refresh singleflight",
            ),
            &["keyspace"],
        )?;
        let singleflight_timeouts = CounterVec::new(
            Opts::new(
                "singleflight_wait_timeout_total",
                "Number of refresh wait budget expirations",
            ),
            &["keyspace"],
        )?;
        let prefetch_scans = Counter::new("prefetch_scan_total", "Number of key cache prefetch scans")?;
        let prefetch_skipped = Counter::new(
            "prefetch_skipped_total",
            "Number of keys skipped due to max in-flight",
        )?;
        let prefetch_triggers = CounterVec::new(
            Opts::new(
                "prefetch_trigger_total",
                "Number of keys scheduled by the background prefetcher",
            ),
            &["keyspace"],
        )?;

        reg.register(Box::new(state_gauge.clone()))?;
        reg.register(Box::new(hard_expired_rejections.clone()))?;
        reg.register(Box::new(rehydrate_latency.clone()))?;
        reg.register(Box::new(rehydrate_total.clone()))?;
        reg.register(Box::new(rehydrate_failures.clone()))?;
        reg.register(Box::new(singleflight_waiters.clone()))?;
        reg.register(Box::new(singleflight_timeouts.clone()))?;
        reg.register(Box::new(prefetch_scans.clone()))?;
        reg.register(Box::new(prefetch_skipped.clone()))?;
        reg.register(Box::new(prefetch_triggers.clone()))?;

        Ok(Self {
            state_gauge,
            hard_expired_rejections,
            rehydrate_latency,
            rehydrate_total,
            rehydrate_failures,
            singleflight_waiters,
            singleflight_timeouts,
            prefetch_scans,
            prefetch_skipped,
            prefetch_triggers,
        })
    }

    /// Unregistered bundle for tests.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("build cache metrics")
    }

    pub(crate) fn update_state(&self, enclave: &str, from: Option<KeyState>, to: KeyState) {
        if let Some(from) = from {
            self.state_gauge
                .with_label_values(&[enclave, from.as_str()])
                .dec();
        }
        self.state_gauge
            .with_label_values(&[enclave, to.as_str()])
            .inc();
    }

    pub(crate) fn inc_hard_expired(&self, keyspace: &str) {
        self.hard_expired_rejections
            .with_label_values(&[keyspace])
            .inc();
    }

    pub(crate) fn observe_rehydrate(&self, keyspace: &str, ms: f64, success: bool) {
        self.rehydrate_latency
            .with_label_values(&[keyspace])
            .observe(ms);
        self.rehydrate_total.with_label_values(&[keyspace]).inc();
        if !success {
            self.rehydrate_failures.with_label_values(&[keyspace]).inc();
        }
    }

    /// Increment the waiter gauge; the returned guard decrements it on drop.
    pub(crate) fn waiter_guard(&self, keyspace: &str) -> WaiterGuard {
        let gauge = self.singleflight_waiters.with_label_values(&[keyspace]);
        gauge.inc();
        WaiterGuard { gauge }
    }

    pub(crate) fn inc_wait_timeout(&self, keyspace: &str) {
        self.singleflight_timeouts
            .with_label_values(&[keyspace])
            .inc();
    }

    pub(crate) fn inc_prefetch_scan(&self) {
        self.prefetch_scans.inc();
    }

    pub(crate) fn inc_prefetch_skipped(&self) {
        self.prefetch_skipped.inc();
    }

    pub(crate) fn inc_prefetch_trigger(&self, keyspace: &str) {
        self.prefetch_triggers.with_label_values(&[keyspace]).inc();
    }

    // Read-side accessors, used by tests and the debug surface.

    /// Current number of entries in `state` for `enclave`.
    pub fn state_count(&self, enclave: &str, state: KeyState) -> i64 {
        self.state_gauge
            .with_label_values(&[enclave, state.as_str()])
            .get()
    }

    /// Total refresh wait-budget expirations for `keyspace`.
    pub fn wait_timeouts(&self, keyspace: &str) -> f64 {
        self.singleflight_timeouts
            .with_label_values(&[keyspace])
            .get()
    }

    /// Total hard-expired rejections for `keyspace`.
    pub fn hard_expired(&self, keyspace: &str) -> f64 {
        self.hard_expired_rejections
            .with_label_values(&[keyspace])
            .get()
    }

    /// Total failed rehydrate attempts for `keyspace`.
    pub fn rehydrate_failures(&self, keyspace: &str) -> f64 {
        self.rehydrate_failures.with_label_values(&[keyspace]).get()
    }

    /// Total keys skipped by the prefetcher due to the in-flight ceiling.
    pub fn prefetch_skipped(&self) -> f64 {
        self.prefetch_skipped.get()
    }

    /// Total keys scheduled by the prefetcher for `keyspace`.
    pub fn prefetch_triggers(&self, keyspace: &str) -> f64 {
        self.prefetch_triggers.with_label_values(&[keyspace]).get()
    }
}

/// Drop guard pairing an increment of the single-flight waiter gauge with its
/// decrement.
pub struct WaiterGuard {
    gauge: IntGauge,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
