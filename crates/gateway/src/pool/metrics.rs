//! Prometheus metrics for the enclave connection pool.

use std::time::Duration;

use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry};

/// Pool metric families: active connections, stream resets, and acquire
/// latency, all labelled by enclave id.
pub struct PoolMetrics {
    active_conns: IntGaugeVec,
    stream_resets: CounterVec,
    acquire_latency: HistogramVec,
}

impl PoolMetrics {
    pub fn new(reg: &Registry) -> prometheus::Result<Self> {
        let active_conns = IntGaugeVec::new(
            Opts::new("active_conns", "Number of established connections per enclave")
                .namespace("signer")
                .subsystem("enclave_pool"),
            &["enclave_id"],
        )?;
        let stream_resets = CounterVec::new(
            Opts::new(
                "grpc_stream_resets_total",
                "Total number of stream reset events",
            )
            .namespace("signer")
            .subsystem("enclave_pool"),
            &["enclave_id"],
        )?;
        let acquire_latency = HistogramVec::new(
            HistogramOpts::new(
                "pool_acquire_latency_ms",
                "Time spent waiting for a pooled connection in milliseconds",
            )
            .namespace("signer")
            .subsystem("enclave_pool")
            .buckets(vec![
                0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0,
            ]),
            &["enclave_id"],
        )?;
        reg.register(Box::new(active_conns.clone()))?;
        reg.register(Box::new(stream_resets.clone()))?;
        reg.register(Box::new(acquire_latency.clone()))?;
        Ok(Self {
            active_conns,
            stream_resets,
            acquire_latency,
        })
    }

    /// Unregistered bundle for tests.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("build pool metrics")
    }

    pub(crate) fn set_active(&self, enclave_id: &str, value: i64) {
        self.active_conns.with_label_values(&[enclave_id]).set(value);
    }

    pub(crate) fn inc_stream_reset(&self, enclave_id: &str) {
        self.stream_resets.with_label_values(&[enclave_id]).inc();
    }

    pub(crate) fn observe_acquire(&self, enclave_id: &str, elapsed: Duration) {
        self.acquire_latency
            .with_label_values(&[enclave_id])
            .observe(elapsed.as_secs_f64() * 1000.0);
    }

    /// Current connection count recorded for `enclave_id`.
    pub fn active(&self, enclave_id: &str) -> i64 {
        self.active_conns.with_label_values(&[enclave_id]).get()
    }

    /// Total stream resets recorded for `enclave_id`.
    pub fn stream_resets(&self, enclave_id: &str) -> f64 {
        self.stream_resets.with_label_values(&[enclave_id]).get()
    }
}
