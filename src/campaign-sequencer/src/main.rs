//! Campaign Sequencer — post-service follow-up enrollment and touch scheduling.
//!
//! Main entry point that wires the engine and starts the server.

use campaign_api::ApiServer;
use campaign_cache::RedisRateLimiter;
use campaign_channels::{
    ChannelDispatcher, EmailConfig, EmailProvider, PassthroughComposer, SmsProvider, TwilioConfig,
};
use campaign_core::config::AppConfig;
use campaign_delivery::{RateLimiter, SlidingWindowLimiter};
use campaign_enrollment::{EngineStore, SequencerEngine};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-sequencer")]
#[command(about = "Campaign enrollment and touch scheduling engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_SEQUENCER__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CAMPAIGN_SEQUENCER__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Shared secret for trigger routes (overrides config)
    #[arg(long, env = "CAMPAIGN_SEQUENCER__AUTH__CRON_SECRET", hide_env_values = true)]
    cron_secret: Option<String>,

    /// Run the batch and conflict sweep in-process every N seconds
    /// instead of waiting for an external scheduler
    #[arg(long)]
    poll_interval_secs: Option<u64>,
}

async fn build_limiter(config: &AppConfig) -> Arc<dyn RateLimiter> {
    if config.redis.enabled {
        match RedisRateLimiter::connect(&config.redis, &config.rate_limit).await {
            Ok(limiter) => return Arc::new(limiter),
            Err(e) => {
                error!(error = %e, "Failed to connect to Redis, falling back to in-process rate limiting");
            }
        }
    }
    Arc::new(SlidingWindowLimiter::from_config(&config.rate_limit))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "campaign_sequencer=info,campaign_enrollment=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Sequencer starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secret) = cli.cron_secret {
        config.auth.cron_secret = secret;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        batch_limit = config.batch.limit,
        redis = config.redis.enabled,
        "Configuration loaded"
    );

    let limiter = build_limiter(&config).await;

    let dispatcher = SequencerEngine::dispatcher_for(&config)
        .with_sender(Arc::new(EmailProvider::new(EmailConfig::default())))
        .with_sender(Arc::new(SmsProvider::new(TwilioConfig::default())));

    let engine = Arc::new(SequencerEngine::new(
        config.clone(),
        Arc::new(EngineStore::new()),
        dispatcher,
        Arc::new(PassthroughComposer),
        limiter,
    ));

    let api_server = ApiServer::new(config.clone(), engine.clone());

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    if let Some(secs) = cli.poll_interval_secs.filter(|s| *s > 0) {
        let engine = engine.clone();
        info!(interval_secs = secs, "In-process trigger loop enabled");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
            loop {
                interval.tick().await;
                let now = chrono::Utc::now();
                if let Err(e) = engine.run_batch(now, None).await {
                    error!(error = %e, "Scheduled touch batch aborted");
                }
                engine.run_conflict_sweep(now);
            }
        });
    }

    info!("Campaign Sequencer is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
