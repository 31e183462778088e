//! Rate Limiter (C2): token-bucket admission control, per spec §4.5.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_per_second: 1.0,
        }
    }
}

/// One key's bucket. `tokens_milli` stores tokens scaled by 1000 so the
/// bucket can be updated with a single atomic swap rather than a lock.
struct Bucket {
    tokens_milli: AtomicI64,
    last_refill_millis: AtomicI64,
}

/// Token-bucket rate limiter keyed by an arbitrary string (session id,
/// principal, backend id). Concrete, not a trait (spec §6.4): every caller
/// gets the same algorithm, only the config varies.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    fn refill(&self, bucket: &Bucket) {
        let now = Utc::now().timestamp_millis();
        let last = bucket.last_refill_millis.swap(now, Ordering::AcqRel);
        let elapsed_ms = (now - last).max(0) as f64;
        if elapsed_ms == 0.0 {
            return;
        }
        let added_milli = (elapsed_ms / 1000.0 * self.config.refill_per_second * 1000.0) as i64;
        if added_milli == 0 {
            return;
        }
        let cap_milli = self.config.capacity as i64 * 1000;
        let mut current = bucket.tokens_milli.load(Ordering::Acquire);
        loop {
            let next = (current + added_milli).min(cap_milli);
            match bucket
                .tokens_milli
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Attempt to withdraw `cost` tokens for `key`. Returns `(allowed,
    /// retry_after)`; `retry_after` is only meaningful when `allowed` is
    /// `false`.
    pub fn check(&self, key: &str, cost: u32) -> (bool, Duration) {
        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens_milli: AtomicI64::new(self.config.capacity as i64 * 1000),
            last_refill_millis: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        self.refill(&bucket);

        let cost_milli = cost as i64 * 1000;
        let mut current = bucket.tokens_milli.load(Ordering::Acquire);
        loop {
            if current < cost_milli {
                let deficit_milli = cost_milli - current;
                let seconds = deficit_milli as f64 / 1000.0 / self.config.refill_per_second.max(f64::EPSILON);
                return (false, Duration::from_secs_f64(seconds.max(0.0)));
            }
            let next = current - cost_milli;
            match bucket
                .tokens_milli
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return (true, Duration::ZERO),
                Err(observed) => current = observed,
            }
        }
    }
}
