//! Per-target circuit breaker: failure grading plus explicit drain.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Health grade of a pool target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Healthy,
    Degraded,
    Draining,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Healthy => "healthy",
            BreakerState::Degraded => "degraded",
            BreakerState::Draining => "draining",
        }
    }
}

/// Three-state breaker. `Degraded` recovers automatically after the
/// cooldown; `Draining` is entered only by explicit drain and is sticky.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_change: Instant,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Healthy,
                failures: 0,
                last_change: Instant::now(),
            }),
        }
    }

    /// Whether a new acquisition may proceed. Recovers a cooled-down
    /// degraded breaker as a side effect.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Draining {
            return false;
        }
        if inner.state == BreakerState::Degraded && inner.last_change.elapsed() > self.cooldown {
            inner.state = BreakerState::Healthy;
            inner.failures = 0;
            inner.last_change = Instant::now();
        }
        true
    }

    /// Record a success: failures reset and a degraded breaker heals.
    pub fn success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        if inner.state == BreakerState::Degraded {
            inner.state = BreakerState::Healthy;
            inner.last_change = Instant::now();
        }
    }

    /// Record a failure. Returns `true` when this failure trips the breaker
    /// into `Degraded`.
    pub fn failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        if inner.failures >= self.threshold && inner.state == BreakerState::Healthy {
            inner.state = BreakerState::Degraded;
            inner.last_change = Instant::now();
            return true;
        }
        false
    }

    /// Enter the sticky draining state.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Draining;
        inner.last_change = Instant::now();
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(1));
        assert!(!cb.failure());
        assert!(!cb.failure());
        assert!(cb.failure());
        assert_eq!(cb.state(), BreakerState::Degraded);
        // Degraded but not draining still allows traffic.
        assert!(cb.allow());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(1));
        cb.failure();
        cb.success();
        assert!(!cb.failure());
        assert_eq!(cb.state(), BreakerState::Healthy);
    }

    #[test]
    fn degraded_recovers_after_cooldown() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(5));
        cb.failure();
        assert_eq!(cb.state(), BreakerState::Degraded);
        std::thread::sleep(Duration::from_millis(10));
        assert!(cb.allow());
        assert_eq!(cb.state(), BreakerState::Healthy);
    }

    #[test]
    fn draining_denies_and_is_sticky() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(1));
        cb.drain();
        assert!(!cb.allow());
        cb.success();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cb.allow());
        assert_eq!(cb.state(), BreakerState::Draining);
    }
}
