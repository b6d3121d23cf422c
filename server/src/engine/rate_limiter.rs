use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Token-bucket rate limiter keyed by string (client IP for the web layer).
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    max_tokens: u32,
    refill_rate: f64, // tokens per second
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// - `max_tokens`: burst capacity
    /// - `per_seconds`: one token is refilled every N seconds
    pub fn new(max_tokens: u32, per_seconds: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            max_tokens,
            refill_rate: 1.0 / per_seconds,
        }
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.max_tokens as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.max_tokens as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Forget keys untouched for longer than `older_than`. Returns how many were dropped.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.duration_since(b.last_refill) < older_than);
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
