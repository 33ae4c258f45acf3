use crate::lru::LruIndex;
use std::collections::HashMap;
use std::time::Instant;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Whole tokens (or requests) still available after this call.
    pub remaining: u64,
    /// Configured limit, for the `X-RateLimit-Limit` header.
    pub limit: u64,
    /// Seconds until the bucket/window is fully replenished.
    pub reset_in_secs: f64,
    /// Seconds to wait before the denied request could succeed.
    pub retry_after_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Maximum tokens a bucket holds.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Keys tracked before LRU eviction kicks in.
    pub max_buckets: usize,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_rate: 100.0,
            max_buckets: 100_000,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token buckets with continuous refill and LRU key eviction.
///
/// Worker-local; the invariant `0 <= tokens <= capacity` holds after
/// every operation.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    buckets: HashMap<String, Bucket>,
    lru: LruIndex,
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterStats {
    pub tracked_keys: usize,
    pub approx_bytes: usize,
}

impl TokenBucketLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
            lru: LruIndex::new(),
        }
    }

    /// Take `n` tokens from `key`'s bucket.
    pub fn consume(&mut self, key: &str, n: f64) -> Decision {
        self.consume_at(key, n, Instant::now())
    }

    pub fn consume_at(&mut self, key: &str, n: f64, now: Instant) -> Decision {
        let capacity = self.config.capacity;
        let rate = self.config.refill_rate;

        let bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        // Continuous refill since the last touch.
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = now;

        let decision = if bucket.tokens >= n {
            bucket.tokens -= n;
            Decision {
                allowed: true,
                remaining: bucket.tokens.floor() as u64,
                limit: capacity as u64,
                reset_in_secs: (capacity - bucket.tokens) / rate,
                retry_after_secs: None,
            }
        } else {
            Decision {
                allowed: false,
                remaining: bucket.tokens.floor() as u64,
                limit: capacity as u64,
                reset_in_secs: (capacity - bucket.tokens) / rate,
                retry_after_secs: Some((n - bucket.tokens) / rate),
            }
        };

        self.lru.touch(key);
        self.evict_excess();
        decision
    }

    /// Refill and report without consuming.
    pub fn check(&mut self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&mut self, key: &str, now: Instant) -> Decision {
        let d = self.consume_at(key, 0.0, now);
        Decision {
            retry_after_secs: None,
            ..d
        }
    }

    pub fn reset(&mut self, key: &str) {
        self.buckets.remove(key);
        self.lru.remove(key);
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.lru.clear();
    }

    pub fn stats(&self) -> LimiterStats {
        let approx_bytes = self
            .buckets
            .keys()
            .map(|k| k.len() + std::mem::size_of::<Bucket>())
            .sum();
        LimiterStats {
            tracked_keys: self.buckets.len(),
            approx_bytes,
        }
    }

    fn evict_excess(&mut self) {
        while self.buckets.len() > self.config.max_buckets {
            let Some(victim) = self.lru.pop_lru() else {
                break;
            };
            self.buckets.remove(&victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(capacity: f64, rate: f64) -> TokenBucketLimiter {
        TokenBucketLimiter::new(TokenBucketConfig {
            capacity,
            refill_rate: rate,
            max_buckets: 1_000,
        })
    }

    #[test]
    fn test_burst_then_deny_then_refill() {
        let mut lim = limiter(5.0, 5.0);
        let t0 = Instant::now();

        // Five back-to-back requests drain the bucket.
        for expected_remaining in [4, 3, 2, 1, 0] {
            let d = lim.consume_at("k", 1.0, t0);
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
            assert_eq!(d.limit, 5);
        }

        // Sixth is denied with retry_after ≈ 1/rate.
        let d = lim.consume_at("k", 1.0, t0);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        let retry = d.retry_after_secs.unwrap();
        assert!((retry - 0.2).abs() < 1e-9, "retry_after was {}", retry);

        // One second later the bucket is full again.
        let d = lim.consume_at("k", 1.0, t0 + Duration::from_secs(1));
        assert!(d.allowed);
        assert_eq!(d.remaining, 4);
    }

    #[test]
    fn test_tokens_bounded_by_capacity() {
        let mut lim = limiter(3.0, 10.0);
        let t0 = Instant::now();
        lim.consume_at("k", 1.0, t0);
        // A long idle period must not overfill the bucket.
        let d = lim.check_at("k", t0 + Duration::from_secs(3600));
        assert_eq!(d.remaining, 3);
        for _ in 0..10 {
            let d = lim.consume_at("k", 1.0, t0 + Duration::from_secs(3600));
            assert!(d.remaining <= 3);
        }
    }

    #[test]
    fn test_check_does_not_consume() {
        let mut lim = limiter(2.0, 1.0);
        let t0 = Instant::now();
        let d1 = lim.check_at("k", t0);
        let d2 = lim.check_at("k", t0);
        assert_eq!(d1.remaining, 2);
        assert_eq!(d2.remaining, 2);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut lim = limiter(1.0, 1.0);
        let t0 = Instant::now();
        assert!(lim.consume_at("a", 1.0, t0).allowed);
        assert!(!lim.consume_at("a", 1.0, t0).allowed);
        assert!(lim.consume_at("b", 1.0, t0).allowed);
    }

    #[test]
    fn test_lru_eviction_of_buckets() {
        let mut lim = TokenBucketLimiter::new(TokenBucketConfig {
            capacity: 1.0,
            refill_rate: 1.0,
            max_buckets: 2,
        });
        let t0 = Instant::now();
        lim.consume_at("a", 1.0, t0);
        lim.consume_at("b", 1.0, t0);
        lim.consume_at("a", 0.0, t0); // keep "a" warm
        lim.consume_at("c", 1.0, t0); // evicts "b"
        assert_eq!(lim.stats().tracked_keys, 2);

        // "b" was evicted; a fresh bucket admits immediately.
        assert!(lim.consume_at("b", 1.0, t0).allowed);
    }

    #[test]
    fn test_reset_and_clear() {
        let mut lim = limiter(1.0, 0.001);
        let t0 = Instant::now();
        assert!(lim.consume_at("k", 1.0, t0).allowed);
        assert!(!lim.consume_at("k", 1.0, t0).allowed);
        lim.reset("k");
        assert!(lim.consume_at("k", 1.0, t0).allowed);
        lim.clear();
        assert_eq!(lim.stats().tracked_keys, 0);
    }

    #[test]
    fn test_partial_refill() {
        let mut lim = limiter(10.0, 2.0);
        let t0 = Instant::now();
        for _ in 0..10 {
            lim.consume_at("k", 1.0, t0);
        }
        // 1.5s at 2 tokens/s = 3 tokens back.
        let d = lim.consume_at("k", 1.0, t0 + Duration::from_millis(1500));
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }
}
