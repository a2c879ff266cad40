//! Send executor — composes a touch's message, dispatches it under the
//! touch's idempotency key and records the result on the send record.

use std::collections::HashMap;
use std::sync::Arc;

use campaign_channels::{
    classify, ChannelDispatcher, ComposeContext, ContentComposer, FailureKind, OutboundMessage,
};
use campaign_core::types::{idempotency_key, Channel, SendRecord, SendStatus};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::claimer::ClaimedTouch;
use crate::store::EngineStore;

const COMPOSE_FAILED_ERROR_CODE: &str = "compose_failed";
const NO_RECIPIENT_ERROR_CODE: &str = "invalid_recipient";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Delivered {
        provider_message_id: Option<String>,
        at: DateTime<Utc>,
    },
    Failed {
        kind: FailureKind,
        code: Option<String>,
        error: String,
    },
}

pub struct SendExecutor {
    store: Arc<EngineStore>,
    dispatcher: Arc<ChannelDispatcher>,
    composer: Arc<dyn ContentComposer>,
}

impl SendExecutor {
    pub fn new(
        store: Arc<EngineStore>,
        dispatcher: Arc<ChannelDispatcher>,
        composer: Arc<dyn ContentComposer>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            composer,
        }
    }

    /// The send record for a claimed touch. Re-claims of the same touch get
    /// the existing record back.
    pub fn prepare(&self, claim: &ClaimedTouch, channel: Channel, now: DateTime<Utc>) -> SendRecord {
        let (record, created) = self.store.get_or_create_send(SendRecord {
            id: Uuid::new_v4(),
            owner_id: claim.owner_id,
            customer_id: claim.customer_id,
            enrollment_id: claim.enrollment_id,
            campaign_id: claim.campaign_id,
            touch_number: claim.touch_number,
            channel,
            status: SendStatus::Pending,
            provider_message_id: None,
            error: None,
            idempotency_key: idempotency_key(claim.enrollment_id, claim.touch_number),
            created_at: now,
            sent_at: None,
        });
        if !created {
            debug!(send_id = %record.id, status = ?record.status, "Reusing send record");
        }
        record
    }

    /// Compose and dispatch. Success marks the record sent; a permanent
    /// failure marks it failed; a retryable failure leaves it pending.
    pub async fn execute(&self, send: &SendRecord, now: DateTime<Utc>) -> CampaignResult<SendResult> {
        let customer = self
            .store
            .get_customer(send.customer_id)
            .ok_or_else(|| CampaignError::not_found("Customer", send.customer_id))?;
        let campaign = self
            .store
            .get_campaign(send.campaign_id)
            .ok_or_else(|| CampaignError::not_found("Campaign", send.campaign_id))?;
        let touch = campaign.touch(send.touch_number).ok_or_else(|| {
            CampaignError::Validation(format!(
                "campaign {} has no touch {}",
                campaign.id, send.touch_number
            ))
        })?;

        let recipient = match send.channel {
            Channel::Email => customer.email.clone(),
            Channel::Sms => customer.phone.clone(),
        };
        let Some(to) = recipient.filter(|r| !r.trim().is_empty()) else {
            return self.record_failure(
                send,
                FailureKind::Permanent,
                Some(NO_RECIPIENT_ERROR_CODE.to_string()),
                format!("customer has no {} address", send.channel),
            );
        };

        let service_type = self
            .store
            .get_enrollment(send.enrollment_id)
            .and_then(|e| self.store.get_job(e.job_id))
            .map(|j| j.service_type);
        let context = ComposeContext {
            owner_id: send.owner_id,
            business_name: self
                .store
                .get_business(send.owner_id)
                .map(|b| b.name)
                .unwrap_or_default(),
            customer_id: customer.id,
            customer_name: customer.name.clone(),
            service_type,
            channel: send.channel,
            touch_number: send.touch_number,
        };

        let composed = match self.composer.compose(&touch.content_ref, &context).await {
            Ok(composed) => composed,
            Err(err) => {
                warn!(send_id = %send.id, error = %err, "Compose failed");
                return self.record_failure(
                    send,
                    FailureKind::Retryable,
                    Some(COMPOSE_FAILED_ERROR_CODE.to_string()),
                    err.to_string(),
                );
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert("enrollment_id".to_string(), send.enrollment_id.to_string());
        metadata.insert("touch_number".to_string(), send.touch_number.to_string());
        metadata.insert("owner_id".to_string(), send.owner_id.to_string());

        let message = OutboundMessage {
            channel: send.channel,
            to,
            subject: composed.subject,
            body: composed.body,
            idempotency_key: send.idempotency_key.clone(),
            metadata,
        };

        let outcome = self.dispatcher.dispatch(&message).await;
        if outcome.success {
            let provider_message_id = outcome.provider_message_id.clone();
            self.store.update_send(send.id, |s| {
                s.status = SendStatus::Sent;
                s.provider_message_id = provider_message_id.clone();
                s.error = None;
                s.sent_at = Some(now);
            })?;
            return Ok(SendResult::Delivered {
                provider_message_id,
                at: now,
            });
        }

        let kind = classify(outcome.error_code.as_deref());
        let error = outcome
            .error
            .unwrap_or_else(|| "unknown channel error".to_string());
        self.record_failure(send, kind, outcome.error_code, error)
    }

    fn record_failure(
        &self,
        send: &SendRecord,
        kind: FailureKind,
        code: Option<String>,
        error: String,
    ) -> CampaignResult<SendResult> {
        let message = error.clone();
        self.store.update_send(send.id, |s| {
            s.error = Some(message);
            if kind == FailureKind::Permanent {
                s.status = SendStatus::Failed;
            }
        })?;
        debug!(send_id = %send.id, kind = ?kind, code = ?code, "Send failed");
        Ok(SendResult::Failed { kind, code, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_channels::{PassthroughComposer, ScriptedSender, SendOutcome};
    use campaign_core::types::{
        Campaign, CampaignStatus, Customer, SmsConsent, TouchDefinition,
    };
    use std::time::Duration as StdDuration;

    struct Fixture {
        store: Arc<EngineStore>,
        sms: Arc<ScriptedSender>,
        executor: SendExecutor,
        claim: ClaimedTouch,
    }

    fn fixture(phone: Option<&str>) -> Fixture {
        let store = Arc::new(EngineStore::new());
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Reminders".to_string(),
            service_type: None,
            status: CampaignStatus::Active,
            touches: vec![TouchDefinition {
                touch_number: 1,
                channel: Channel::Sms,
                delay_hours: 0,
                content_ref: "Thanks for choosing us".to_string(),
            }],
            created_at: now,
            updated_at: now,
        };
        let customer = Customer {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Sam".to_string(),
            phone: phone.map(str::to_string),
            sms_consent: SmsConsent::OptedIn,
            ..Default::default()
        };
        let claim = ClaimedTouch {
            enrollment_id: Uuid::new_v4(),
            campaign_id: campaign.id,
            owner_id: owner,
            customer_id: customer.id,
            job_id: Uuid::new_v4(),
            touch_number: 1,
            scheduled_at: now,
            claimed_at: now,
        };
        store.upsert_campaign(campaign);
        store.upsert_customer(customer);

        let sms = Arc::new(ScriptedSender::new(Channel::Sms));
        let dispatcher = ChannelDispatcher::new(StdDuration::from_secs(1)).with_sender(sms.clone());
        let executor = SendExecutor::new(store.clone(), Arc::new(dispatcher), Arc::new(PassthroughComposer));
        Fixture {
            store,
            sms,
            executor,
            claim,
        }
    }

    #[tokio::test]
    async fn test_delivery_marks_send_sent() {
        let f = fixture(Some("+15550001111"));
        let now = Utc::now();
        let send = f.executor.prepare(&f.claim, Channel::Sms, now);
        let result = f.executor.execute(&send, now).await.unwrap();
        assert!(matches!(result, SendResult::Delivered { .. }));

        let stored = f.store.get_send(send.id).unwrap();
        assert_eq!(stored.status, SendStatus::Sent);
        assert_eq!(stored.sent_at, Some(now));
        let calls = f.sms.calls();
        assert_eq!(calls[0].body, "Thanks for choosing us");
        assert_eq!(calls[0].idempotency_key, idempotency_key(f.claim.enrollment_id, 1));
    }

    #[tokio::test]
    async fn test_prepare_reuses_record() {
        let f = fixture(Some("+15550001111"));
        let now = Utc::now();
        let a = f.executor.prepare(&f.claim, Channel::Sms, now);
        let b = f.executor.prepare(&f.claim, Channel::Sms, now);
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_missing_phone_is_permanent() {
        let f = fixture(None);
        let now = Utc::now();
        let send = f.executor.prepare(&f.claim, Channel::Sms, now);
        let result = f.executor.execute(&send, now).await.unwrap();
        assert!(matches!(
            result,
            SendResult::Failed {
                kind: FailureKind::Permanent,
                ..
            }
        ));
        assert_eq!(f.store.get_send(send.id).unwrap().status, SendStatus::Failed);
        assert!(f.sms.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_send_pending() {
        let f = fixture(Some("+15550001111"));
        f.sms.push(SendOutcome::failed("30008", "Unknown carrier error"));
        let now = Utc::now();
        let send = f.executor.prepare(&f.claim, Channel::Sms, now);
        let result = f.executor.execute(&send, now).await.unwrap();
        assert!(matches!(
            result,
            SendResult::Failed {
                kind: FailureKind::Retryable,
                ..
            }
        ));
        let stored = f.store.get_send(send.id).unwrap();
        assert_eq!(stored.status, SendStatus::Pending);
        assert_eq!(stored.error.as_deref(), Some("Unknown carrier error"));
    }
}
