//! Lazy-refill token bucket.

use std::time::Instant;

/// Capacity and refill rate for one bucket; the per-tier template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
}

/// A single token bucket. Refill happens lazily on access from a monotonic
/// clock; callers pass `now` in so concurrent refills of the same bucket are
/// serialized by the owning lock, not by this type.
#[derive(Debug)]
pub struct TokenBucket {
    spec: BucketSpec,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(spec: BucketSpec, now: Instant) -> Self {
        Self {
            spec,
            tokens: spec.capacity,
            last_refill: now,
        }
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.spec.refill_rate).min(self.spec.capacity);
        self.last_refill = now;
    }

    /// Whether a token is available, after refilling.
    pub fn peek(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    /// Take one token if available, after refilling.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one full token is available again.
    pub fn retry_after_secs(&self) -> u64 {
        if self.tokens >= 1.0 {
            return 0;
        }
        ((1.0 - self.tokens) / self.spec.refill_rate).ceil() as u64
    }

    /// Swap in a new spec, clamping stored tokens to the new capacity.
    pub fn reconfigure(&mut self, spec: BucketSpec) {
        self.spec = spec;
        self.tokens = self.tokens.min(spec.capacity);
    }

    /// Last access time; used by the idle sweeper.
    pub fn last_touched(&self) -> Instant {
        self.last_refill
    }

    #[cfg(test)]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(capacity: f64, rate: f64) -> BucketSpec {
        BucketSpec {
            capacity,
            refill_rate: rate,
        }
    }

    #[test]
    fn test_consume_until_empty() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(spec(3.0, 1.0), now);
        assert!(bucket.try_consume(now));
        assert!(bucket.try_consume(now));
        assert!(bucket.try_consume(now));
        assert!(!bucket.try_consume(now));
        assert_eq!(bucket.retry_after_secs(), 1);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(spec(2.0, 10.0), now);
        assert!(bucket.try_consume(now));
        bucket.refill(now + Duration::from_secs(60));
        assert!(bucket.tokens() <= 2.0);
        assert!((bucket.tokens() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_fractional_refill() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(spec(1.0, 1.0), now);
        assert!(bucket.try_consume(now));

        // 100ms at 1 token/sec: still short of a full token.
        assert!(!bucket.peek(now + Duration::from_millis(100)));
        assert_eq!(bucket.retry_after_secs(), 1);

        // After a full second, exactly one token is back.
        assert!(bucket.try_consume(now + Duration::from_millis(1100)));
        assert!(!bucket.try_consume(now + Duration::from_millis(1100)));
    }

    #[test]
    fn test_reconfigure_clamps_tokens() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(spec(100.0, 10.0), now);
        bucket.reconfigure(spec(5.0, 1.0));
        assert!(bucket.tokens() <= 5.0);
        assert!(bucket.try_consume(now));
    }
}
