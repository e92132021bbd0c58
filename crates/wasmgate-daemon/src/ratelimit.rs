use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::RateLimitSettings;

/// Classic token bucket: `rate` tokens per second refill, `burst` capacity.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last: Instant,
    rate: f64,
    burst: f64,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst),
            last: now,
            rate,
            burst: f64::from(burst),
        }
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-tenant limiter map. Buckets are created on first sight of a tenant;
/// a daemon without `rate_limit` configured admits everything.
pub struct TenantRateLimiter {
    settings: Option<RateLimitSettings>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl TenantRateLimiter {
    pub fn new(settings: Option<RateLimitSettings>) -> Self {
        Self {
            settings,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, tenant: &str) -> bool {
        self.allow_at(tenant, Instant::now())
    }

    fn allow_at(&self, tenant: &str, now: Instant) -> bool {
        let Some(settings) = self.settings else {
            return true;
        };
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(tenant.to_string())
            .or_insert_with(|| TokenBucket::new(settings.rate, settings.effective_burst(), now));
        bucket.allow_at(now)
    }
}
