//! SendGrid-style email sender.
//!
//! Builds the provider payload and records the send; the HTTP call itself
//! sits behind this type so the engine never sees provider details.

use async_trait::async_trait;
use campaign_core::types::Channel;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sender::{ChannelSender, OutboundMessage, SendOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub from_email: String,
    pub from_name: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from_email: "no-reply@example.com".to_string(),
            from_name: "Follow-ups".to_string(),
        }
    }
}

pub struct EmailProvider {
    config: EmailConfig,
    /// idempotency key -> provider message id
    sent: DashMap<String, String>,
}

impl EmailProvider {
    pub fn new(config: EmailConfig) -> Self {
        info!(from = %config.from_email, "Email provider initialized");
        Self {
            config,
            sent: DashMap::new(),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    fn looks_like_email(address: &str) -> bool {
        match address.trim().split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
            }
            None => false,
        }
    }
}

#[async_trait]
impl ChannelSender for EmailProvider {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        if !Self::looks_like_email(&message.to) {
            return SendOutcome::failed("invalid_format", format!("Invalid email address: {}", message.to));
        }

        if let Some(existing) = self.sent.get(&message.idempotency_key) {
            debug!(key = %message.idempotency_key, "Duplicate email suppressed");
            return SendOutcome::delivered(existing.value().clone());
        }

        let _payload = serde_json::json!({
            "personalizations": [{
                "to": [{"email": message.to}],
                "custom_args": message.metadata,
            }],
            "from": {
                "email": self.config.from_email,
                "name": self.config.from_name
            },
            "subject": message.subject.clone().unwrap_or_default(),
            "content": [{"type": "text/plain", "value": message.body}],
            "headers": {"Idempotency-Key": message.idempotency_key},
        });

        let provider_id = format!("sg-{}", uuid::Uuid::new_v4());
        self.sent
            .entry(message.idempotency_key.clone())
            .or_insert_with(|| provider_id.clone());

        metrics::counter!("channels.email.sent").increment(1);
        debug!(to = %message.to, provider_id = %provider_id, "Email accepted");

        SendOutcome::delivered(provider_id)
    }
}
