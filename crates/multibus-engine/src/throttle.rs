//! Token-bucket rate limiting applied at the bus admission boundary
//! (spec §4.6).

use parking_lot::Mutex;
use std::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket. Refills continuously based on elapsed wall-clock
/// time rather than on a timer tick, so burst capacity is exact regardless
/// of how often `try_acquire` is polled.
pub struct Throttler {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl Throttler {
    /// `rate_per_sec` tokens are added per second, up to `burst` capacity
    /// (spec §4.6: "burst capacity" and "sustained rate").
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        let capacity = burst.max(1.0);
        Self {
            capacity,
            refill_per_sec: rate_per_sec.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Attempts to withdraw one token; returns `false` without blocking if
    /// none is available (admission is a fast, non-blocking check — spec
    /// §4.6).
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1.0)
    }

    pub fn try_acquire_n(&self, cost: f64) -> bool {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        state.tokens
    }

    /// Hot reconfiguration of the rate without losing accumulated tokens
    /// (spec §4.7.7 hot reconfiguration applies to throttle settings too).
    pub fn reconfigure(&self, rate_per_sec: f64, burst: f64) -> Throttler {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        let carried_tokens = state.tokens.min(burst.max(1.0));
        Throttler {
            capacity: burst.max(1.0),
            refill_per_sec: rate_per_sec.max(0.0),
            state: Mutex::new(BucketState {
                tokens: carried_tokens,
                last_refill: Instant::now(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn burst_capacity_is_immediately_available() {
        let t = Throttler::new(10.0, 5.0);
        for _ in 0..5 {
            assert!(t.try_acquire());
        }
        assert!(!t.try_acquire());
    }

    #[test]
    fn tokens_refill_over_time() {
        let t = Throttler::new(1000.0, 1.0);
        assert!(t.try_acquire());
        assert!(!t.try_acquire());
        sleep(Duration::from_millis(20));
        assert!(t.try_acquire());
    }

    #[test]
    fn reconfigure_carries_tokens_within_new_burst() {
        let t = Throttler::new(10.0, 10.0);
        t.try_acquire_n(7.0);
        let reconfigured = t.reconfigure(5.0, 2.0);
        assert!(reconfigured.available() <= 2.0);
    }
}
