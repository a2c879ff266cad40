//! The channel sender contract consumed by the engine.

use std::collections::HashMap;

use async_trait::async_trait;
use campaign_core::types::Channel;
use serde::{Deserialize, Serialize};

/// A fully composed message ready for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    /// Identical for every attempt at the same touch; providers de-duplicate on it.
    pub idempotency_key: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Provider response for one send call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl SendOutcome {
    pub fn delivered(provider_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
            error_code: None,
        }
    }

    pub fn failed(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(error.into()),
            error_code: Some(code.into()),
        }
    }
}

/// Wire-level transport for one channel (email or SMS).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;
    async fn send(&self, message: &OutboundMessage) -> SendOutcome;
}
