//! Token-bucket rate limiter for the unlock dispatcher.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::clock::Clock;

/// Token bucket refilled at `rate` tokens per second up to `burst` tokens.
///
/// The bucket starts full. [`TokenBucket::allow`] consumes one token when
/// available and reports whether the call may proceed.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: SystemTime,
}

impl TokenBucket {
    /// Create a bucket. `rate` must be positive; `burst` is floored at 1.
    pub fn new(rate: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: clock.now(),
            }),
            clock,
        }
    }

    /// Consume one token if available.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Ok(elapsed) = now.duration_since(state.last_refill) {
            state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        }
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
