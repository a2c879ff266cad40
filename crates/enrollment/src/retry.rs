//! Retry queue — backoff retries for transient channel failures.
//!
//! Items are claimed with the same compare-and-swap discipline as touches
//! (pending -> processing). Quiet-hours and rate-limit requeues reschedule
//! the item in place and never consume the attempt budget.

use std::sync::Arc;

use campaign_channels::FailureKind;
use campaign_core::config::RetryConfig;
use campaign_core::types::{
    EnrollmentStatus, RetryQueueItem, RetryReason, RetryStatus, SendStatus,
};
use campaign_core::{CampaignError, CampaignResult};
use campaign_delivery::{check_eligibility, DeliveryGatekeeper, QuietHoursDecision};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::alerts::AlertCenter;
use crate::claimer::TouchClaimer;
use crate::executor::{SendExecutor, SendResult};
use crate::store::EngineStore;

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Queued(RetryQueueItem),
    /// The attempt budget is spent; the send is failed and an alert raised.
    Exhausted { alert_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryItemOutcome {
    Sent,
    Requeued,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RetryReport {
    pub processed: usize,
    pub sent: usize,
    pub requeued: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct RetryQueue {
    store: Arc<EngineStore>,
    executor: Arc<SendExecutor>,
    gatekeeper: Arc<DeliveryGatekeeper>,
    claimer: Arc<TouchClaimer>,
    alerts: Arc<AlertCenter>,
    config: RetryConfig,
}

impl RetryQueue {
    pub fn new(
        store: Arc<EngineStore>,
        executor: Arc<SendExecutor>,
        gatekeeper: Arc<DeliveryGatekeeper>,
        claimer: Arc<TouchClaimer>,
        alerts: Arc<AlertCenter>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            executor,
            gatekeeper,
            claimer,
            alerts,
            config,
        }
    }

    /// Backoff before attempt `attempt_count + 1`. Past the end of the
    /// schedule the last step repeats.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let minutes = self
            .config
            .backoff_minutes
            .get(attempt_count as usize)
            .or_else(|| self.config.backoff_minutes.last())
            .copied()
            .unwrap_or(1);
        Duration::minutes(minutes)
    }

    /// Queue another attempt for a send. Once `attempt_count` reaches the
    /// budget the send is marked failed instead; quiet-hours requeues are
    /// exempt from the budget.
    pub fn enqueue(
        &self,
        send_id: Uuid,
        reason: RetryReason,
        attempt_count: u32,
        scheduled_for: Option<DateTime<Utc>>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> CampaignResult<EnqueueOutcome> {
        let send = self
            .store
            .get_send(send_id)
            .ok_or_else(|| CampaignError::not_found("Send", send_id))?;

        if reason != RetryReason::QuietHours && attempt_count >= self.config.max_attempts {
            let error = last_error.unwrap_or_else(|| "retry attempts exhausted".to_string());
            let failed = self.store.update_send(send_id, |s| {
                s.status = SendStatus::Failed;
                s.error = Some(error.clone());
                s.clone()
            })?;
            let alert = self.alerts.raise(
                &failed,
                format!("Delivery failed after {attempt_count} retries: {error}"),
                now,
            );
            warn!(send_id = %send_id, attempts = attempt_count, "Retry attempts exhausted");
            metrics::counter!("retry.exhausted").increment(1);
            return Ok(EnqueueOutcome::Exhausted { alert_id: alert.id });
        }

        let item = RetryQueueItem {
            id: Uuid::new_v4(),
            send_id,
            customer_id: send.customer_id,
            attempt_count,
            max_attempts: self.config.max_attempts,
            scheduled_for: scheduled_for.unwrap_or_else(|| now + self.backoff(attempt_count)),
            status: RetryStatus::Pending,
            reason,
            last_error,
            created_at: now,
            claimed_at: None,
        };
        debug!(
            retry_id = %item.id,
            send_id = %send_id,
            attempt = attempt_count,
            scheduled_for = %item.scheduled_for,
            "Retry enqueued"
        );
        metrics::counter!("retry.enqueued").increment(1);
        self.store.insert_retry(item.clone());
        Ok(EnqueueOutcome::Queued(item))
    }

    /// Claim up to `limit` due items (pending -> processing).
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<Vec<RetryQueueItem>> {
        let mut claimed = Vec::new();
        for (id, _) in self.store.due_retries(now) {
            if claimed.len() >= limit {
                break;
            }
            let item = self.store.update_retry(id, |r| {
                if r.status != RetryStatus::Pending || r.scheduled_for > now {
                    return Ok(None);
                }
                r.status = RetryStatus::Processing;
                r.claimed_at = Some(now);
                Ok(Some(r.clone()))
            })?;
            claimed.extend(item);
        }
        Ok(claimed)
    }

    /// Return items stuck in processing past `stale` to pending.
    pub fn recover_stuck(&self, now: DateTime<Utc>, stale: Duration) -> CampaignResult<usize> {
        let cutoff = now - stale;
        let mut recovered = 0;
        for id in self.store.retries_processing_before(cutoff) {
            let reset = self.store.update_retry(id, |r| {
                if r.status != RetryStatus::Processing {
                    return Ok(false);
                }
                r.status = RetryStatus::Pending;
                r.claimed_at = None;
                Ok(true)
            })?;
            if reset {
                warn!(retry_id = %id, "Recovered stuck retry item");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Run one claimed item: re-check consent, quiet hours and rate limit,
    /// then attempt the send.
    pub async fn process_item(&self, item: &RetryQueueItem, now: DateTime<Utc>) -> CampaignResult<RetryItemOutcome> {
        let send = self
            .store
            .get_send(item.send_id)
            .ok_or_else(|| CampaignError::not_found("Send", item.send_id))?;

        if send.status == SendStatus::Sent {
            self.finish(item.id, RetryStatus::Completed, None)?;
            return Ok(RetryItemOutcome::Sent);
        }

        let stopped = self
            .store
            .get_enrollment(send.enrollment_id)
            .map(|e| e.status == EnrollmentStatus::Stopped)
            .unwrap_or(true);
        if stopped {
            self.cancel(item.id, send.id, "enrollment stopped")?;
            return Ok(RetryItemOutcome::Cancelled);
        }

        let customer = self
            .store
            .get_customer(send.customer_id)
            .ok_or_else(|| CampaignError::not_found("Customer", send.customer_id))?;
        if let Some(reason) = check_eligibility(send.channel, &customer).skip_reason {
            self.cancel(item.id, send.id, reason.as_str())?;
            return Ok(RetryItemOutcome::Cancelled);
        }

        let owner_timezone = self.store.get_business(send.owner_id).and_then(|b| b.timezone);
        if let QuietHoursDecision::Deferred { until } =
            self.gatekeeper
                .check_quiet_hours(now, &customer, owner_timezone.as_deref())
        {
            self.requeue(item.id, RetryReason::QuietHours, until)?;
            return Ok(RetryItemOutcome::Requeued);
        }

        if !self.gatekeeper.check_rate_limit(send.channel, send.owner_id, now).await {
            let until = now + Duration::seconds(self.config.rate_limit_delay_secs);
            self.requeue(item.id, RetryReason::RateLimit, until)?;
            return Ok(RetryItemOutcome::Requeued);
        }

        match self.executor.execute(&send, now).await? {
            SendResult::Delivered { at, .. } => {
                self.finish(item.id, RetryStatus::Completed, None)?;
                self.claimer
                    .mark_touch_sent(send.enrollment_id, send.touch_number, at)?;
                info!(send_id = %send.id, attempt = item.attempt_count, "Retry delivered");
                Ok(RetryItemOutcome::Sent)
            }
            SendResult::Failed {
                kind: FailureKind::Permanent,
                error,
                ..
            } => {
                self.finish(item.id, RetryStatus::Failed, Some(error.clone()))?;
                if let Some(failed) = self.store.get_send(send.id) {
                    self.alerts.raise(&failed, error, now);
                }
                Ok(RetryItemOutcome::Failed)
            }
            SendResult::Failed {
                kind: FailureKind::Retryable,
                error,
                ..
            } => {
                self.finish(item.id, RetryStatus::Failed, Some(error.clone()))?;
                match self.enqueue(
                    send.id,
                    RetryReason::ChannelError,
                    item.attempt_count + 1,
                    None,
                    Some(error),
                    now,
                )? {
                    EnqueueOutcome::Queued(_) => Ok(RetryItemOutcome::Requeued),
                    EnqueueOutcome::Exhausted { .. } => Ok(RetryItemOutcome::Failed),
                }
            }
        }
    }

    /// Claim and process every due item, one at a time.
    pub async fn process_due(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<RetryReport> {
        let mut report = RetryReport::default();
        for item in self.claim_due(now, limit)? {
            report.processed += 1;
            match self.process_item(&item, now).await {
                Ok(RetryItemOutcome::Sent) => report.sent += 1,
                Ok(RetryItemOutcome::Requeued) => report.requeued += 1,
                Ok(RetryItemOutcome::Failed) => report.failed += 1,
                Ok(RetryItemOutcome::Cancelled) => report.cancelled += 1,
                Err(err) => {
                    warn!(retry_id = %item.id, error = %err, "Retry item errored");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn requeue(&self, id: Uuid, reason: RetryReason, until: DateTime<Utc>) -> CampaignResult<()> {
        self.store.update_retry(id, |r| {
            r.status = RetryStatus::Pending;
            r.reason = reason;
            r.scheduled_for = until;
            r.claimed_at = None;
            Ok(())
        })?;
        debug!(retry_id = %id, reason = ?reason, until = %until, "Retry requeued");
        Ok(())
    }

    fn finish(&self, id: Uuid, status: RetryStatus, error: Option<String>) -> CampaignResult<()> {
        self.store.update_retry(id, |r| {
            r.status = status;
            if error.is_some() {
                r.last_error = error;
            }
            Ok(())
        })
    }

    fn cancel(&self, id: Uuid, send_id: Uuid, reason: &str) -> CampaignResult<()> {
        self.finish(id, RetryStatus::Cancelled, Some(reason.to_string()))?;
        self.store.update_send(send_id, |s| {
            s.status = SendStatus::Skipped;
            s.error = Some(reason.to_string());
        })?;
        info!(retry_id = %id, send_id = %send_id, reason, "Retry cancelled");
        Ok(())
    }
}
