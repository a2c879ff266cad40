//! Sliding-window rate limiter shared across nodes through Redis.
//!
//! Each key is a sorted set of admission timestamps. Trimming, counting and
//! recording run inside one Lua script so concurrent workers on different
//! nodes see a single atomic counter.

use std::collections::HashMap;

use async_trait::async_trait;
use campaign_core::config::{RateLimitConfig, RedisConfig};
use campaign_core::types::Channel;
use campaign_delivery::RateLimiter;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{info, warn};
use uuid::Uuid;

const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[4])
  redis.call('PEXPIRE', KEYS[1], ARGV[5])
  return 1
end
return 0
"#;

pub struct RedisRateLimiter {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
    window_ms: i64,
    default_limit: u32,
    channel_limits: HashMap<String, u32>,
}

impl RedisRateLimiter {
    /// Connect to Redis and verify connectivity.
    pub async fn connect(redis: &RedisConfig, limits: &RateLimitConfig) -> anyhow::Result<Self> {
        info!(url = %redis.url, "Connecting to Redis rate limiter");

        let client = redis::Client::open(redis.url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        let mut channel_limits = HashMap::new();
        channel_limits.insert(Channel::Email.as_str().to_string(), limits.email_per_window);
        channel_limits.insert(Channel::Sms.as_str().to_string(), limits.sms_per_window);

        Ok(Self {
            conn,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            key_prefix: redis.key_prefix.clone(),
            window_ms: limits.window_secs as i64 * 1000,
            default_limit: limits.email_per_window,
            channel_limits,
        })
    }

    fn limit_for(&self, key: &str) -> u32 {
        key.split(':')
            .next()
            .and_then(|prefix| self.channel_limits.get(prefix))
            .copied()
            .unwrap_or(self.default_limit)
    }

    async fn try_allow(&self, key: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let now_ms = now.timestamp_millis();
        let redis_key = format!("{}:{}", self.key_prefix, key);
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let mut conn = self.conn.clone();
        let admitted: i32 = self
            .script
            .key(&redis_key)
            .arg(now_ms - self.window_ms)
            .arg(now_ms)
            .arg(self.limit_for(key))
            .arg(member)
            .arg(self.window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    /// Fails open: an unreachable counter store must not halt every send.
    async fn allow(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.try_allow(key, now).await {
            Ok(allowed) => {
                if !allowed {
                    metrics::counter!("rate_limit.denied").increment(1);
                }
                allowed
            }
            Err(e) => {
                warn!(error = %e, key = %key, "Redis rate limiter unavailable, allowing send");
                metrics::counter!("rate_limit.backend_errors").increment(1);
                true
            }
        }
    }
}
