use serde::Deserialize;

/// Root application configuration. Loaded from an optional
/// `config/sequencer.toml` and environment variables with the prefix
/// `CAMPAIGN_SEQUENCER__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub quiet_hours: QuietHoursConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Shared secret presented by the external timer on every trigger call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub cron_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_limit")]
    pub limit: usize,
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: i64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuietHoursConfig {
    /// First local hour sends are allowed (inclusive).
    #[serde(default = "default_quiet_start_hour")]
    pub start_hour: u32,
    /// First local hour sends are no longer allowed.
    #[serde(default = "default_quiet_end_hour")]
    pub end_hour: u32,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_email_per_window")]
    pub email_per_window: u32,
    #[serde(default = "default_sms_per_window")]
    pub sms_per_window: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Delay before attempt N+1, indexed by the attempt count.
    #[serde(default = "default_backoff_minutes")]
    pub backoff_minutes: Vec<i64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_rate_limit_delay_secs")]
    pub rate_limit_delay_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConflictConfig {
    /// Minimum gap after a previous enrollment ends before a queued job enrolls.
    #[serde(default = "default_cooldown_days")]
    pub cooldown_days: i64,
    #[serde(default = "default_stale_conflict_hours")]
    pub stale_conflict_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

// Default functions
fn default_node_id() -> String {
    "sequencer-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_batch_limit() -> usize {
    50
}
fn default_stale_claim_minutes() -> i64 {
    10
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_max_parallel() -> usize {
    10
}
fn default_quiet_start_hour() -> u32 {
    8
}
fn default_quiet_end_hour() -> u32 {
    21
}
fn default_timezone() -> String {
    "America/New_York".to_string()
}
fn default_window_secs() -> u64 {
    3600
}
fn default_email_per_window() -> u32 {
    100
}
fn default_sms_per_window() -> u32 {
    100
}
fn default_backoff_minutes() -> Vec<i64> {
    vec![1, 5, 15]
}
fn default_max_attempts() -> u32 {
    3
}
fn default_rate_limit_delay_secs() -> i64 {
    60
}
fn default_cooldown_days() -> i64 {
    7
}
fn default_stale_conflict_hours() -> i64 {
    24
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            limit: default_batch_limit(),
            stale_claim_minutes: default_stale_claim_minutes(),
            send_timeout_ms: default_send_timeout_ms(),
            max_parallel: default_max_parallel(),
        }
    }
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            start_hour: default_quiet_start_hour(),
            end_hour: default_quiet_end_hour(),
            default_timezone: default_timezone(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            email_per_window: default_email_per_window(),
            sms_per_window: default_sms_per_window(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_minutes: default_backoff_minutes(),
            max_attempts: default_max_attempts(),
            rate_limit_delay_secs: default_rate_limit_delay_secs(),
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            cooldown_days: default_cooldown_days(),
            stale_conflict_hours: default_stale_conflict_hours(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            batch: BatchConfig::default(),
            quiet_hours: QuietHoursConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            conflict: ConflictConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the optional config file, then environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/sequencer").required(false))
            .add_source(
                config::Environment::with_prefix("CAMPAIGN_SEQUENCER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("retry.backoff_minutes"),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.quiet_hours.start_hour, 8);
        assert_eq!(config.quiet_hours.end_hour, 21);
        assert_eq!(config.retry.backoff_minutes, vec![1, 5, 15]);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.batch.stale_claim_minutes, 10);
        assert_eq!(config.conflict.stale_conflict_hours, 24);
        assert!(config.auth.cron_secret.is_empty());
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"conflict": {"cooldown_days": 3}, "auth": {"cron_secret": "s"}}"#)
                .unwrap();
        assert_eq!(config.conflict.cooldown_days, 3);
        assert_eq!(config.conflict.stale_conflict_hours, 24);
        assert_eq!(config.auth.cron_secret, "s");
        assert_eq!(config.api.http_port, 8080);
    }
}
