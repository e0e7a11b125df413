//! Per-client token bucket rate limiting.
//!
//! One [`RateLimiter`] exists per rate-limited method; it lazily creates a
//! bucket per client id. Buckets refill continuously at `refill_per_sec` up
//! to `capacity`.

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;

use crate::handler::RateLimitRule;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by client id.
pub struct RateLimiter {
    rule: RateLimitRule,
    buckets: DashMap<String, Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `client_id`; `false` means the request must be
    /// rejected with RATE_LIMIT_EXCEEDED.
    pub fn try_acquire(&self, client_id: &str) -> bool {
        self.try_acquire_at(client_id, Instant::now())
    }

    fn try_acquire_at(&self, client_id: &str, now: Instant) -> bool {
        let entry = self.buckets.entry(client_id.to_string()).or_insert_with(|| {
            Mutex::new(TokenBucket {
                tokens: f64::from(self.rule.capacity),
                last_refill: now,
            })
        });

        let mut bucket = entry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rule.refill_per_sec)
            .min(f64::from(self.rule.capacity));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Number of clients with live buckets.
    pub fn client_count(&self) -> usize {
        self.buckets.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
