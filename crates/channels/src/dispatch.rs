//! Channel dispatcher — routes a message to its channel's sender under a
//! bounded timeout so one hung provider call cannot stall a batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use campaign_core::types::Channel;
use tracing::{debug, info, warn};

use crate::errors::{NOT_CONFIGURED_ERROR_CODE, TIMEOUT_ERROR_CODE};
use crate::sender::{ChannelSender, OutboundMessage, SendOutcome};

pub struct ChannelDispatcher {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    timeout: Duration,
}

impl ChannelDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            senders: HashMap::new(),
            timeout,
        }
    }

    /// Register a sender under the channel it reports.
    pub fn with_sender(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        let channel = sender.channel();
        info!(channel = %channel, "Channel sender registered");
        self.senders.insert(channel, sender);
        self
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.senders.contains_key(&channel)
    }

    pub async fn dispatch(&self, message: &OutboundMessage) -> SendOutcome {
        let Some(sender) = self.senders.get(&message.channel) else {
            warn!(channel = %message.channel, "No sender configured for channel");
            return SendOutcome::failed(
                NOT_CONFIGURED_ERROR_CODE,
                format!("Channel {} not configured", message.channel),
            );
        };

        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, sender.send(message)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    channel = %message.channel,
                    key = %message.idempotency_key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Channel send timed out"
                );
                SendOutcome::failed(TIMEOUT_ERROR_CODE, "Channel send timed out")
            }
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        metrics::histogram!("channels.send_latency_ms", "channel" => message.channel.as_str())
            .record(latency_ms as f64);
        debug!(
            channel = %message.channel,
            success = outcome.success,
            latency_ms,
            "Channel dispatch finished"
        );

        outcome
    }
}
