//! Exponential backoff with multiplicative jitter for reconnect loops.

use std::time::Duration;

use rand::Rng;

/// Parameters for [`Backoff`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// First delay, and the floor for every subsequent delay.
    pub initial: Duration,
    /// Ceiling for every delay.
    pub max: Duration,
    /// Jitter factor: each delay is multiplied by a uniform sample from
    /// `[1 - jitter, 1 + jitter]`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(25),
            max: Duration::from_millis(200),
            jitter: 0.2,
        }
    }
}

/// Stateful exponential backoff.
///
/// `next()` returns `clamp(initial << attempts, initial, max)` scaled by the
/// jitter factor; `attempts` saturates at 16 so the shift never overflows.
#[derive(Debug)]
pub struct Backoff {
    cfg: BackoffConfig,
    attempts: u32,
}

const MAX_ATTEMPT_SHIFT: u32 = 16;

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempts: 0 }
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next(&mut self) -> Duration {
        let mut base = self
            .cfg
            .initial
            .saturating_mul(1u32 << self.attempts.min(MAX_ATTEMPT_SHIFT));
        if base.is_zero() || base > self.cfg.max {
            base = self.cfg.max;
        }
        if self.cfg.jitter > 0.0 {
            let low = 1.0 - self.cfg.jitter;
            let high = 1.0 + self.cfg.jitter;
            let factor = rand::thread_rng().gen_range(low..=high);
            base = base.mul_f64(factor);
        }
        if self.attempts < MAX_ATTEMPT_SHIFT {
            self.attempts += 1;
        }
        base.clamp(self.cfg.initial, self.cfg.max)
    }

    /// Forget past failures; the next delay starts from `initial` again.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
