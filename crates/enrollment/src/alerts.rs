//! Owner-facing alerts for sends that could not be delivered.

use std::sync::Arc;

use campaign_core::types::{
    RetryQueueItem, RetryReason, RetryStatus, SendRecord, SendStatus,
};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::store::EngineStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Retried,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub customer_id: Uuid,
    pub send_id: Uuid,
    pub kind: AlertKind,
    pub message: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub struct AlertCenter {
    store: Arc<EngineStore>,
    max_attempts: u32,
}

impl AlertCenter {
    pub fn new(store: Arc<EngineStore>, max_attempts: u32) -> Self {
        Self { store, max_attempts }
    }

    pub fn raise(&self, send: &SendRecord, message: impl Into<String>, now: DateTime<Utc>) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            owner_id: send.owner_id,
            customer_id: send.customer_id,
            send_id: send.id,
            kind: AlertKind::SendFailed,
            message: message.into(),
            status: AlertStatus::Open,
            created_at: now,
            resolved_at: None,
        };
        info!(
            alert_id = %alert.id,
            send_id = %send.id,
            channel = %send.channel,
            "Send failure alert raised"
        );
        metrics::counter!("alerts.raised").increment(1);
        self.store.insert_alert(alert.clone());
        alert
    }

    /// Put the failed send back in line: status pending and a fresh retry
    /// due now, picked up on the next batch pass.
    pub fn retry(&self, alert_id: Uuid, now: DateTime<Utc>) -> CampaignResult<RetryQueueItem> {
        let alert = self.close(alert_id, AlertStatus::Retried, now)?;

        self.store.update_send(alert.send_id, |s| {
            s.status = SendStatus::Pending;
            s.error = None;
        })?;

        let item = RetryQueueItem {
            id: Uuid::new_v4(),
            send_id: alert.send_id,
            customer_id: alert.customer_id,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            scheduled_for: now,
            status: RetryStatus::Pending,
            reason: RetryReason::ChannelError,
            last_error: Some(alert.message.clone()),
            created_at: now,
            claimed_at: None,
        };
        self.store.insert_retry(item.clone());
        info!(alert_id = %alert_id, retry_id = %item.id, "Alert retried");
        Ok(item)
    }

    pub fn acknowledge(&self, alert_id: Uuid, now: DateTime<Utc>) -> CampaignResult<Alert> {
        let alert = self.close(alert_id, AlertStatus::Acknowledged, now)?;
        info!(alert_id = %alert_id, "Alert acknowledged");
        Ok(alert)
    }

    fn close(&self, alert_id: Uuid, status: AlertStatus, now: DateTime<Utc>) -> CampaignResult<Alert> {
        self.store.update_alert(alert_id, |a| {
            if a.status != AlertStatus::Open {
                return Err(CampaignError::InvalidTransition {
                    from: format!("{:?}", a.status),
                    to: format!("{status:?}"),
                });
            }
            a.status = status;
            a.resolved_at = Some(now);
            Ok(a.clone())
        })
    }
}
