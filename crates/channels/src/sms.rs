//! Twilio-style SMS sender with segment calculation and STOP tracking.

use async_trait::async_trait;
use campaign_core::types::Channel;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sender::{ChannelSender, OutboundMessage, SendOutcome};

/// Configuration for the Twilio SMS provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub from_number: String,
    pub status_callback_url: Option<String>,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: "AC_development".to_string(),
            from_number: "+15550000000".to_string(),
            status_callback_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsReceipt {
    pub provider_id: String,
    pub to: String,
    pub segments: u32,
}

pub struct SmsProvider {
    config: TwilioConfig,
    /// idempotency key -> receipt
    sent: DashMap<String, SmsReceipt>,
    /// Numbers that replied STOP; the carrier rejects further sends.
    unsubscribed: DashMap<String, ()>,
}

impl SmsProvider {
    pub fn new(config: TwilioConfig) -> Self {
        tracing::info!(
            account_sid = %config.account_sid,
            from = %config.from_number,
            "Twilio SMS provider initialized"
        );
        Self {
            config,
            sent: DashMap::new(),
            unsubscribed: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TwilioConfig {
        &self.config
    }

    pub fn mark_unsubscribed(&self, number: &str) {
        self.unsubscribed.insert(number.to_string(), ());
    }

    pub fn receipt(&self, idempotency_key: &str) -> Option<SmsReceipt> {
        self.sent.get(idempotency_key).map(|r| r.clone())
    }

    /// E.164: a leading `+` and 8 to 15 digits.
    pub fn is_e164(number: &str) -> bool {
        match number.strip_prefix('+') {
            Some(digits) => {
                (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }

    /// GSM 7-bit: 160 chars single, 153 per part. UCS-2: 70 single, 67 per part.
    pub fn calculate_segments(body: &str) -> u32 {
        if body.is_empty() {
            return 1;
        }
        let chars = body.chars().count() as u32;
        let (single, multi) = if body.chars().all(is_gsm_basic) {
            (160, 153)
        } else {
            (70, 67)
        };
        if chars <= single {
            1
        } else {
            chars.div_ceil(multi)
        }
    }
}

fn is_gsm_basic(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            ' ' | '!' | '"' | '#' | '$' | '%' | '&' | '\'' | '(' | ')' | '*' | '+' | ','
                | '-' | '.' | '/' | ':' | ';' | '<' | '=' | '>' | '?' | '@' | '_' | '\n' | '\r'
                | '£' | '¥' | 'è' | 'é' | 'ù' | 'ì' | 'ò' | 'Ç' | 'Ø' | 'ø' | 'Å' | 'å'
                | 'Ä' | 'Ö' | 'Ñ' | 'Ü' | 'ä' | 'ö' | 'ñ' | 'ü' | 'à' | '§' | '¿' | '¡'
        )
}

#[async_trait]
impl ChannelSender for SmsProvider {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        if !Self::is_e164(&message.to) {
            return SendOutcome::failed("21211", format!("Invalid 'To' phone number: {}", message.to));
        }
        if self.unsubscribed.contains_key(&message.to) {
            return SendOutcome::failed("21610", "Attempt to send to unsubscribed recipient");
        }

        if let Some(existing) = self.sent.get(&message.idempotency_key) {
            tracing::debug!(key = %message.idempotency_key, "Duplicate SMS suppressed");
            return SendOutcome::delivered(existing.provider_id.clone());
        }

        let receipt = SmsReceipt {
            provider_id: format!("SM{}", Uuid::new_v4().simple()),
            to: message.to.clone(),
            segments: Self::calculate_segments(&message.body),
        };
        let provider_id = receipt.provider_id.clone();

        tracing::info!(
            to = %message.to,
            provider_id = %provider_id,
            segments = receipt.segments,
            "SMS message queued"
        );
        metrics::counter!("channels.sms.sent").increment(1);

        self.sent
            .entry(message.idempotency_key.clone())
            .or_insert(receipt);
        SendOutcome::delivered(provider_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn message(to: &str, key: &str) -> OutboundMessage {
        OutboundMessage {
            channel: Channel::Sms,
            to: to.to_string(),
            subject: None,
            body: "Thanks for choosing us!".to_string(),
            idempotency_key: key.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_send_and_retrieve_receipt() {
        let provider = SmsProvider::new(TwilioConfig::default());
        let outcome = provider.send(&message("+15559876543", "e1:touch:1")).await;
        assert!(outcome.success);
        let receipt = provider.receipt("e1:touch:1").unwrap();
        assert_eq!(receipt.to, "+15559876543");
        assert_eq!(receipt.segments, 1);
        assert_eq!(outcome.provider_message_id, Some(receipt.provider_id));
    }

    #[tokio::test]
    async fn test_same_key_never_double_sends() {
        let provider = SmsProvider::new(TwilioConfig::default());
        let a = provider.send(&message("+15559876543", "e1:touch:2")).await;
        let b = provider.send(&message("+15559876543", "e1:touch:2")).await;
        assert_eq!(a.provider_message_id, b.provider_message_id);
    }

    #[tokio::test]
    async fn test_recipient_errors() {
        let provider = SmsProvider::new(TwilioConfig::default());
        let bad = provider.send(&message("555-1234", "k")).await;
        assert_eq!(bad.error_code.as_deref(), Some("21211"));

        provider.mark_unsubscribed("+15551112222");
        let stopped = provider.send(&message("+15551112222", "k2")).await;
        assert_eq!(stopped.error_code.as_deref(), Some("21610"));
    }

    #[test]
    fn test_calculate_segments() {
        assert_eq!(SmsProvider::calculate_segments(""), 1);
        assert_eq!(SmsProvider::calculate_segments(&"A".repeat(160)), 1);
        assert_eq!(SmsProvider::calculate_segments(&"A".repeat(161)), 2);
        assert_eq!(SmsProvider::calculate_segments(&"B".repeat(307)), 3);
        assert_eq!(SmsProvider::calculate_segments(&"\u{1F600}".repeat(10)), 1);
        assert_eq!(SmsProvider::calculate_segments(&format!("{}\u{1F600}", "A".repeat(70))), 2);
    }
}
