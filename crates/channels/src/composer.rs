//! Content composition boundary. Message text is produced elsewhere; the
//! engine only hands over a content reference and context.

use async_trait::async_trait;
use campaign_core::types::Channel;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeContext {
    pub owner_id: Uuid,
    pub business_name: String,
    pub customer_id: Uuid,
    pub customer_name: String,
    pub service_type: Option<String>,
    pub channel: Channel,
    pub touch_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedMessage {
    pub subject: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait ContentComposer: Send + Sync {
    async fn compose(
        &self,
        content_ref: &str,
        context: &ComposeContext,
    ) -> anyhow::Result<ComposedMessage>;
}

/// Uses the content reference itself as the body. Stands in for the real
/// composer in development and tests.
#[derive(Debug, Default, Clone)]
pub struct PassthroughComposer;

#[async_trait]
impl ContentComposer for PassthroughComposer {
    async fn compose(
        &self,
        content_ref: &str,
        context: &ComposeContext,
    ) -> anyhow::Result<ComposedMessage> {
        let subject = match context.channel {
            Channel::Email => Some(format!("A message from {}", context.business_name)),
            Channel::Sms => None,
        };
        Ok(ComposedMessage {
            subject,
            body: content_ref.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passthrough_subject_only_for_email() {
        let mut ctx = ComposeContext {
            owner_id: Uuid::new_v4(),
            business_name: "Acme Plumbing".to_string(),
            customer_id: Uuid::new_v4(),
            customer_name: "Sam".to_string(),
            service_type: None,
            channel: Channel::Email,
            touch_number: 1,
        };
        let email = PassthroughComposer.compose("review-1", &ctx).await.unwrap();
        assert_eq!(email.body, "review-1");
        assert!(email.subject.unwrap().contains("Acme Plumbing"));

        ctx.channel = Channel::Sms;
        let sms = PassthroughComposer.compose("review-2", &ctx).await.unwrap();
        assert!(sms.subject.is_none());
    }
}
