//! Sliding-window send limiter keyed by `(channel, owner)`.
//!
//! The engine only needs `allow(key, now)`, so any atomic counter store can back
//! it. The in-memory implementation here serves single-node deployments and
//! tests; `campaign-cache` provides the shared Redis backend.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use campaign_core::config::RateLimitConfig;
use campaign_core::types::Channel;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Minimal atomic admission check as of `now`. Returning `true` consumes
/// one slot.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, key: &str, now: DateTime<Utc>) -> bool;
}

/// Builds the limiter key for a channel/owner pair, e.g. `sms:<owner>`.
pub fn rate_limit_key(channel: Channel, owner_id: Uuid) -> String {
    format!("{}:{}", channel.as_str(), owner_id)
}

/// In-memory sliding-window limiter backed by DashMap.
///
/// Each key keeps the timestamps of admitted sends inside the window; the
/// per-key entry lock makes check-and-record a single atomic step.
pub struct SlidingWindowLimiter {
    window: Duration,
    default_limit: u32,
    /// Limit overrides keyed by the key prefix before the first `:`.
    prefix_limits: HashMap<String, u32>,
    entries: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, default_limit: u32) -> Self {
        Self {
            window,
            default_limit,
            prefix_limits: HashMap::new(),
            entries: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(Duration::seconds(config.window_secs as i64), config.email_per_window)
            .with_limit(Channel::Email.as_str(), config.email_per_window)
            .with_limit(Channel::Sms.as_str(), config.sms_per_window)
    }

    pub fn with_limit(mut self, prefix: &str, limit: u32) -> Self {
        self.prefix_limits.insert(prefix.to_string(), limit);
        self
    }

    fn limit_for(&self, key: &str) -> u32 {
        key.split(':')
            .next()
            .and_then(|prefix| self.prefix_limits.get(prefix))
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Check (and consume) a slot for `key` as of `now`.
    pub fn allow_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let limit = self.limit_for(key) as usize;
        let window_start = now - self.window;

        let mut entry = self.entries.entry(key.to_string()).or_default();
        while entry.front().map(|t| *t <= window_start).unwrap_or(false) {
            entry.pop_front();
        }

        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            metrics::counter!("rate_limit.denied").increment(1);
            false
        }
    }

    /// Sends admitted for `key` inside the window ending at `now`.
    pub fn usage_at(&self, key: &str, now: DateTime<Utc>) -> usize {
        let window_start = now - self.window;
        self.entries
            .get(key)
            .map(|e| e.iter().filter(|t| **t > window_start).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn allow(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.allow_at(key, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_rate_limit_basic() {
        let limiter = SlidingWindowLimiter::new(Duration::hours(1), 5);
        let now = Utc::now();

        for i in 0..5 {
            assert!(limiter.allow_at("email:1", now), "send {i} should be allowed");
        }
        assert!(!limiter.allow_at("email:1", now));
        assert_eq!(limiter.usage_at("email:1", now), 5);
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(Duration::hours(1), 2);
        let start = Utc::now();

        assert!(limiter.allow_at("sms:a", start));
        assert!(limiter.allow_at("sms:a", start + Duration::minutes(30)));
        assert!(!limiter.allow_at("sms:a", start + Duration::minutes(45)));
        // The first send falls out of the window
        assert!(limiter.allow_at("sms:a", start + Duration::minutes(61)));
    }

    #[test]
    fn test_keys_are_independent_and_prefix_limits_apply() {
        let limiter = SlidingWindowLimiter::new(Duration::hours(1), 1).with_limit("sms", 3);
        let now = Utc::now();
        let owner = Uuid::new_v4();

        let email = rate_limit_key(Channel::Email, owner);
        let sms = rate_limit_key(Channel::Sms, owner);
        assert!(email.starts_with("email:"));

        assert!(limiter.allow_at(&email, now));
        assert!(!limiter.allow_at(&email, now));
        for _ in 0..3 {
            assert!(limiter.allow_at(&sms, now));
        }
        assert!(!limiter.allow_at(&sms, now));
    }

    #[test]
    fn test_concurrent_allow_never_exceeds_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::new(Duration::hours(1), 50));
        let admitted = Arc::new(AtomicUsize::new(0));
        let now = Utc::now();

        std::thread::scope(|s| {
            for _ in 0..8 {
                let limiter = limiter.clone();
                let admitted = admitted.clone();
                s.spawn(move || {
                    for _ in 0..20 {
                        if limiter.allow_at("email:shared", now) {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_trait_object() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(SlidingWindowLimiter::new(Duration::hours(1), 1));
        let now = Utc::now();
        assert!(limiter.allow("k", now).await);
        assert!(!limiter.allow("k", now).await);
        assert!(limiter.allow("k", now + Duration::hours(2)).await);
    }
}
