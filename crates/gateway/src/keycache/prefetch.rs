//! Background prefetcher: proactively refreshes soon-to-expire entries so
//! the hot path rarely pays a synchronous rehydration.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::debug;

use crate::util::clock::{system_clock, Clock};

use super::metrics::CacheMetrics;
use super::refresh::RefreshScheduler;
use super::store::EntryIterator;

/// Parameters for [`Prefetcher`]. Zero-valued fields take the documented
/// defaults.
pub struct PrefetcherConfig {
    pub iterator: Arc<dyn EntryIterator>,
    pub scheduler: Arc<dyn RefreshScheduler>,
    pub clock: Option<Arc<dyn Clock>>,
    pub metrics: Option<Arc<CacheMetrics>>,
    /// Refresh entries whose soft TTL is within this window. Default 2 min.
    pub refresh_window: Duration,
    /// Overrides the per-entry low-water mark when non-zero.
    pub low_water: u32,
    /// Scan period randomization, as a fraction of the interval. Default 10%.
    pub jitter_percent: f64,
    /// Scan period. Default: half the refresh window.
    pub interval: Duration,
    /// Per-scan ceiling on scheduled refreshes. Default 32.
    pub max_in_flight: usize,
}

/// Periodically scans the entry iterator and schedules background refreshes.
pub struct Prefetcher {
    iterator: Arc<dyn EntryIterator>,
    scheduler: Arc<dyn RefreshScheduler>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CacheMetrics>,
    refresh_window: Duration,
    low_water: u32,
    jitter_percent: f64,
    interval: Duration,
    max_in_flight: usize,
    shutdown: watch::Sender<bool>,
}

impl Prefetcher {
    pub fn new(mut cfg: PrefetcherConfig) -> Self {
        if cfg.refresh_window.is_zero() {
            cfg.refresh_window = Duration::from_secs(2 * 60);
        }
        if cfg.interval.is_zero() {
            cfg.interval = cfg.refresh_window / 2;
        }
        if cfg.jitter_percent <= 0.0 {
            cfg.jitter_percent = 0.1;
        }
        if cfg.max_in_flight == 0 {
            cfg.max_in_flight = 32;
        }
        let (shutdown, _) = watch::channel(false);
        Self {
            iterator: cfg.iterator,
            scheduler: cfg.scheduler,
            clock: cfg.clock.unwrap_or_else(system_clock),
            metrics: cfg
                .metrics
                .unwrap_or_else(|| Arc::new(CacheMetrics::unregistered())),
            refresh_window: cfg.refresh_window,
            low_water: cfg.low_water,
            jitter_percent: cfg.jitter_percent,
            interval: cfg.interval,
            max_in_flight: cfg.max_in_flight,
            shutdown,
        }
    }

    /// Start the background scan loop. Runs until [`Prefetcher::stop`] or
    /// until `self` is dropped.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let pause = tokio::time::sleep(this.next_interval());
                tokio::select! {
                    _ = pause => this.run_once(),
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Stop the background scan loop.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Scan all entries once and schedule refreshes, bounded by the per-scan
    /// in-flight ceiling. Exposed for tests.
    pub fn run_once(&self) {
        self.metrics.inc_prefetch_scan();
        let now = self.clock.now();
        let mut triggered = 0usize;
        for entry in self.iterator.snapshot() {
            if !entry.should_prefetch(now, self.refresh_window, self.low_water) {
                continue;
            }
            if triggered >= self.max_in_flight {
                self.metrics.inc_prefetch_skipped();
                continue;
            }
            triggered += 1;
            self.metrics.inc_prefetch_trigger(entry.keyspace());
            self.scheduler
                .spawn(entry.keyspace(), entry.key_id(), entry.refresh_task());
            debug!(key = %entry.key_id(), keyspace = %entry.keyspace(), "prefetch refresh scheduled");
        }
    }

    fn next_interval(&self) -> Duration {
        let base = self.interval.as_secs_f64();
        let jitter = base * self.jitter_percent;
        let delta = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base + delta).max(0.001))
    }
}
