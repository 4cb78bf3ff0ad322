//! Prometheus metrics for the asynchronous unlock dispatcher.

use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry};

fn label_or_unknown(value: &str) -> &str {
    if value.is_empty() {
        "unknown"
    } else {
        value
    }
}

/// Dispatcher metric families: queue depth, background starts, retries,
/// permanent failures, and execution latency.
pub struct UnlockMetrics {
    queue_depth: IntGauge,
    in_flight: IntGauge,
    background_total: CounterVec,
    retry_total: CounterVec,
    fail_total: CounterVec,
    latency: HistogramVec,
}

impl UnlockMetrics {
    pub fn new(reg: &Registry) -> prometheus::Result<Self> {
        let queue_depth = IntGauge::new("unlock_queue_depth", "Number of keys pending unlock")?;
        let in_flight = IntGauge::new(
            "unlock_in_flight",
            "Number of unlock jobs currently executing",
        )?;
        let background_total = CounterVec::new(
            Opts::new("unlock_bg_total", "Background unlock attempts started"),
            &["keyspace", "reason"],
        )?;
        let retry_total = CounterVec::new(
            Opts::new("unlock_retry_total", "Number of unlock retries scheduled"),
            &["keyspace", "reason"],
        )?;
        let fail_total = CounterVec::new(
            Opts::new("unlock_fail_total", "Number of unlock attempts failed permanently"),
            &["keyspace", "reason"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("unlock_latency_ms", "Latency of unlock attempts in milliseconds")
                .buckets(vec![
                    10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2000.0,
                ]),
            &["keyspace"],
        )?;
        reg.register(Box::new(queue_depth.clone()))?;
        reg.register(Box::new(in_flight.clone()))?;
        reg.register(Box::new(background_total.clone()))?;
        reg.register(Box::new(retry_total.clone()))?;
        reg.register(Box::new(fail_total.clone()))?;
        reg.register(Box::new(latency.clone()))?;
        Ok(Self {
            queue_depth,
            in_flight,
            background_total,
            retry_total,
            fail_total,
            latency,
        })
    }

    /// Unregistered bundle for tests.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("build unlock metrics")
    }

    pub(crate) fn inc_queue_depth(&self) {
        self.queue_depth.inc();
    }

    pub(crate) fn dec_queue_depth(&self) {
        self.queue_depth.dec();
    }

    pub(crate) fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.inc();
        InFlightGuard {
            gauge: self.in_flight.clone(),
        }
    }

    pub(crate) fn inc_background(&self, keyspace: &str, reason: &str) {
        self.background_total
            .with_label_values(&[label_or_unknown(keyspace), label_or_unknown(reason)])
            .inc();
    }

    pub(crate) fn inc_retry(&self, keyspace: &str, reason: &str) {
        self.retry_total
            .with_label_values(&[label_or_unknown(keyspace), label_or_unknown(reason)])
            .inc();
    }

    pub(crate) fn inc_fail(&self, keyspace: &str, reason: &str) {
        self.fail_total
            .with_label_values(&[label_or_unknown(keyspace), label_or_unknown(reason)])
            .inc();
    }

    pub(crate) fn observe_latency(&self, keyspace: &str, ms: f64) {
        self.latency
            .with_label_values(&[label_or_unknown(keyspace)])
            .observe(ms);
    }

    /// Current queue depth.
    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.get()
    }

    /// Total permanent failures for the keyspace/reason pair.
    pub fn failures(&self, keyspace: &str, reason: &str) -> f64 {
        self.fail_total
            .with_label_values(&[label_or_unknown(keyspace), label_or_unknown(reason)])
            .get()
    }

    /// Total retries scheduled for the keyspace/reason pair.
    pub fn retries(&self, keyspace: &str, reason: &str) -> f64 {
        self.retry_total
            .with_label_values(&[label_or_unknown(keyspace), label_or_unknown(reason)])
            .get()
    }
}

/// Drop guard pairing the in-flight gauge increment with its decrement.
pub struct InFlightGuard {
    gauge: IntGauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
