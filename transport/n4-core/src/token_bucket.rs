//! A plain elapsed-time token bucket, used to cap how often the multipath
//! session is allowed to fan a packet out to every path at once (full
//! duplication burns bandwidth proportional to the path count, so it is
//! rationed rather than applied unconditionally).

use crate::time::{Clock, Timestamp};

/// Token bucket with a fixed capacity and a steady refill rate, computed
/// from elapsed wall-clock time rather than a driven timer — callers poll
/// it by calling [`TokenBucket::try_take`] whenever they want to spend a
/// token, there is no background task.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Timestamp,
}

impl TokenBucket {
    /// Creates a bucket that refills at `refill_per_sec` tokens/second, up
    /// to `capacity` tokens, starting full.
    pub fn new(refill_per_sec: f64, capacity: f64, now: Timestamp) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Timestamp) {
        let elapsed_ms = (now.as_millis() - self.last_refill.as_millis()).max(0) as f64;
        self.tokens = (self.tokens + elapsed_ms / 1000.0 * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempts to spend one token. Returns `true` if a token was
    /// available and has been consumed.
    pub fn try_take(&mut self, now: Timestamp) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Builds the duplication-budget bucket used by the end-to-end session:
/// 10 tokens/second, burst of 10.
pub fn dup_rate_limit<C: Clock>(clock: &C) -> TokenBucket {
    TokenBucket::new(10.0, 10.0, clock.get_time())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::Clock as TestClock;
    use std::time::Duration;

    #[test]
    fn starts_full_and_drains() {
        let clock = TestClock::new();
        let mut bucket = TokenBucket::new(10.0, 10.0, clock.get_time());
        for _ in 0..10 {
            assert!(bucket.try_take(clock.get_time()));
        }
        assert!(!bucket.try_take(clock.get_time()));
    }

    #[test]
    fn refills_over_time() {
        let clock = TestClock::new();
        let mut bucket = TokenBucket::new(10.0, 10.0, clock.get_time());
        for _ in 0..10 {
            assert!(bucket.try_take(clock.get_time()));
        }
        assert!(!bucket.try_take(clock.get_time()));

        clock.inc_by(Duration::from_millis(500));
        assert!(bucket.try_take(clock.get_time()));
        assert!(!bucket.try_take(clock.get_time()));
    }

    #[test]
    fn never_exceeds_capacity() {
        let clock = TestClock::new();
        let mut bucket = TokenBucket::new(10.0, 10.0, clock.get_time());
        clock.inc_by(Duration::from_secs(100));
        bucket.refill(clock.get_time());
        assert!(bucket.tokens <= 10.0);
    }
}
