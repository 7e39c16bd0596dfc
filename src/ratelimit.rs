//! Rate Limiter (§4.D): per-`(ip,user-agent,method,url)` token bucket with
//! a background sweeper for idle buckets.
//!
//! Grounded on the `Arc<RwLock<HashMap<...>>>` keyed-state pattern used
//! throughout `security/auth.rs`, and on the teacher's `tokio::spawn`
//! interval-sweeper in `AuthenticationManager::initialize` for the 5-minute
//! idle-bucket sweep.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::time;

const IDLE_EVICTION: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPreset {
    pub max_requests: u64,
    pub window: Duration,
}

impl RateLimitPreset {
    pub const SEARCH: Self = Self {
        max_requests: 100,
        window: Duration::from_secs(60),
    };
    pub const ADMIN: Self = Self {
        max_requests: 50,
        window: Duration::from_secs(60),
    };
    pub const DEFAULT: Self = Self {
        max_requests: 1000,
        window: Duration::from_secs(3600),
    };
    pub const STRICT: Self = Self {
        max_requests: 10,
        window: Duration::from_secs(60),
    };
}

struct Bucket {
    tokens: u64,
    capacity: u64,
    window: Duration,
    last_refill: Instant,
    last_access: Instant,
}

impl Bucket {
    fn new(preset: RateLimitPreset, now: Instant) -> Self {
        Self {
            tokens: preset.max_requests,
            capacity: preset.max_requests,
            window: preset.window,
            last_refill: now,
            last_access: now,
        }
    }

    /// Refill in whole tokens per the data-model formula — `floor((now -
    /// lastRefill) / windowMs * capacity)`, capped at `capacity` — then try
    /// to take one token. Returns `Ok(remaining)` on success,
    /// `Err(retry_after_secs)` when depleted, computed as
    /// `ceil((lastRefill + windowMs - now) / 1000)` against the refill
    /// instant (tokens are added, `lastRefill` always advances to `now`).
    fn take(&mut self, now: Instant) -> Result<u64, u64> {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refilled = (elapsed.as_secs_f64() / self.window.as_secs_f64()
            * self.capacity as f64)
            .floor() as u64;
        self.tokens = (self.tokens + refilled).min(self.capacity);
        self.last_refill = now;
        self.last_access = now;

        if self.tokens < 1 {
            return Err(self.window.as_secs().max(1));
        }

        self.tokens -= 1;
        Ok(self.tokens)
    }
}

pub struct RateLimitOutcome {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
    pub retry_after_secs: Option<u64>,
}

pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn key(ip: &str, user_agent: &str, method: &str, url: &str) -> String {
        format!("{}|{}|{}|{}", ip, user_agent, method, url)
    }

    pub fn check(&self, key: &str, preset: RateLimitPreset) -> RateLimitOutcome {
        let now = Instant::now();
        let mut buckets = self.buckets.write().unwrap();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(preset, now));

        match bucket.take(now) {
            Ok(remaining) => RateLimitOutcome {
                allowed: true,
                limit: preset.max_requests,
                remaining,
                reset_secs: preset.window.as_secs(),
                retry_after_secs: None,
            },
            Err(retry_after) => RateLimitOutcome {
                allowed: false,
                limit: preset.max_requests,
                remaining: 0,
                reset_secs: retry_after,
                retry_after_secs: Some(retry_after),
            },
        }
    }

    /// Spawn the 5-minute sweep that drops buckets idle for over an hour.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let buckets = self.buckets.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let mut buckets = buckets.write().unwrap();
                buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_access) < IDLE_EVICTION);
            }
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depleting_bucket_returns_429_equivalent() {
        let limiter = RateLimiter::new();
        let preset = RateLimitPreset {
            max_requests: 3,
            window: Duration::from_secs(60),
        };
        let key = RateLimiter::key("1.2.3.4", "ua", "GET", "/x");

        assert!(limiter.check(&key, preset).allowed);
        assert!(limiter.check(&key, preset).allowed);
        assert!(limiter.check(&key, preset).allowed);
        let fourth = limiter.check(&key, preset);
        assert!(!fourth.allowed);
        assert!(fourth.retry_after_secs.is_some());
    }

    #[test]
    fn different_keys_have_independent_buckets() {
        let limiter = RateLimiter::new();
        let preset = RateLimitPreset {
            max_requests: 1,
            window: Duration::from_secs(60),
        };
        let key_a = RateLimiter::key("1.1.1.1", "ua", "GET", "/x");
        let key_b = RateLimiter::key("2.2.2.2", "ua", "GET", "/x");

        assert!(limiter.check(&key_a, preset).allowed);
        assert!(limiter.check(&key_b, preset).allowed);
        assert!(!limiter.check(&key_a, preset).allowed);
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new();
        let preset = RateLimitPreset {
            max_requests: 5,
            window: Duration::from_secs(1),
        };
        let key = RateLimiter::key("1.1.1.1", "ua", "GET", "/x");
        std::thread::sleep(Duration::from_millis(1100));
        let outcome = limiter.check(&key, preset);
        assert!(outcome.remaining <= preset.max_requests);
    }
}
