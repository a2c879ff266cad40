//! Batch runner — one pass of the claim-and-process loop, driven by an
//! external timer.
//!
//! Order: release stale leases, claim due touches, process the claims in
//! parallel (bounded), then work the retry queue. Only a failing claim
//! aborts the pass; a single item's failure is logged and counted.

use std::sync::Arc;

use anyhow::anyhow;
use campaign_channels::FailureKind;
use campaign_core::config::BatchConfig;
use campaign_core::types::{RetryReason, SendStatus};
use campaign_core::{CampaignError, CampaignResult};
use campaign_delivery::{DeliveryGatekeeper, GateDecision, GateRequest};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::alerts::AlertCenter;
use crate::claimer::{ClaimedTouch, TouchClaimer, TouchOutcome};
use crate::executor::{SendExecutor, SendResult};
use crate::retry::{RetryQueue, RetryReport};
use crate::store::EngineStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TouchResults {
    pub processed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BatchSummary {
    pub recovered: usize,
    pub claimed: usize,
    pub results: TouchResults,
    pub retries: RetryReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Sent,
    Skipped,
    Failed,
    Deferred,
}

#[derive(Clone)]
pub struct BatchRunner {
    store: Arc<EngineStore>,
    claimer: Arc<TouchClaimer>,
    gatekeeper: Arc<DeliveryGatekeeper>,
    executor: Arc<SendExecutor>,
    retries: Arc<RetryQueue>,
    alerts: Arc<AlertCenter>,
    config: BatchConfig,
}

impl BatchRunner {
    pub fn new(
        store: Arc<EngineStore>,
        claimer: Arc<TouchClaimer>,
        gatekeeper: Arc<DeliveryGatekeeper>,
        executor: Arc<SendExecutor>,
        retries: Arc<RetryQueue>,
        alerts: Arc<AlertCenter>,
        config: BatchConfig,
    ) -> Self {
        Self {
            store,
            claimer,
            gatekeeper,
            executor,
            retries,
            alerts,
            config,
        }
    }

    pub async fn run_batch(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<BatchSummary> {
        let stale = Duration::minutes(self.config.stale_claim_minutes);
        let recovered = self.claimer.recover_stuck(now, stale)? + self.retries.recover_stuck(now, stale)?;

        let claims = self.claimer.claim_due_touches(now, limit).map_err(|err| {
            error!(error = %err, "Touch claim failed, aborting batch");
            err
        })?;

        let mut summary = BatchSummary {
            recovered,
            claimed: claims.len(),
            ..Default::default()
        };

        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        for claim in claims {
            let runner = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| CampaignError::Internal(anyhow!(e)))?;
                runner.process_claim(&claim, now).await.map_err(|err| {
                    warn!(
                        enrollment_id = %claim.enrollment_id,
                        touch = claim.touch_number,
                        error = %err,
                        "Touch processing failed"
                    );
                    runner.settle_failed(&claim, now);
                    err
                })
            });
        }

        while let Some(joined) = tasks.join_next().await {
            summary.results.processed += 1;
            match joined {
                Ok(Ok(ItemOutcome::Sent)) => summary.results.sent += 1,
                Ok(Ok(ItemOutcome::Skipped)) => summary.results.skipped += 1,
                Ok(Ok(ItemOutcome::Deferred)) => summary.results.deferred += 1,
                Ok(Ok(ItemOutcome::Failed)) | Ok(Err(_)) => summary.results.failed += 1,
                Err(join_err) => {
                    error!(error = %join_err, "Touch task panicked");
                    summary.results.failed += 1;
                }
            }
        }

        summary.retries = self.retries.process_due(now, limit).await?;

        info!(
            claimed = summary.claimed,
            sent = summary.results.sent,
            skipped = summary.results.skipped,
            failed = summary.results.failed,
            deferred = summary.results.deferred,
            retries = summary.retries.processed,
            "Batch finished"
        );
        Ok(summary)
    }

    /// Resolve a touch whose processing errored as failed so the sequence
    /// still advances. Falls back to dropping the lease.
    fn settle_failed(&self, claim: &ClaimedTouch, now: DateTime<Utc>) {
        metrics::counter!("touches.failed", "channel" => "unknown").increment(1);
        if let Err(err) = self.claimer.resolve_touch(claim, TouchOutcome::Failed, now) {
            error!(enrollment_id = %claim.enrollment_id, error = %err, "Could not resolve failed touch, releasing claim");
            if let Err(err) = self.claimer.release(claim) {
                error!(enrollment_id = %claim.enrollment_id, error = %err, "Claim release failed");
            }
        }
    }

    async fn process_claim(&self, claim: &ClaimedTouch, now: DateTime<Utc>) -> CampaignResult<ItemOutcome> {
        let campaign = self
            .store
            .get_campaign(claim.campaign_id)
            .ok_or_else(|| CampaignError::not_found("Campaign", claim.campaign_id))?;
        let channel = campaign
            .touch(claim.touch_number)
            .map(|t| t.channel)
            .ok_or_else(|| {
                CampaignError::Validation(format!(
                    "campaign {} has no touch {}",
                    campaign.id, claim.touch_number
                ))
            })?;
        let customer = self
            .store
            .get_customer(claim.customer_id)
            .ok_or_else(|| CampaignError::not_found("Customer", claim.customer_id))?;

        let send = self.executor.prepare(claim, channel, now);
        if send.status == SendStatus::Sent {
            debug!(send_id = %send.id, "Touch already delivered, resolving without resend");
            self.claimer.resolve_touch(
                claim,
                TouchOutcome::Sent {
                    at: send.sent_at.unwrap_or(now),
                },
                now,
            )?;
            return Ok(ItemOutcome::Sent);
        }

        let owner_timezone = self.store.get_business(claim.owner_id).and_then(|b| b.timezone);
        let decision = self
            .gatekeeper
            .evaluate(GateRequest {
                channel,
                owner_id: claim.owner_id,
                customer: &customer,
                owner_timezone: owner_timezone.as_deref(),
                scheduled_at: claim.scheduled_at,
                now,
            })
            .await;

        match decision {
            GateDecision::Skip { reason } => {
                self.store.update_send(send.id, |s| {
                    s.status = SendStatus::Skipped;
                    s.error = Some(reason.as_str().to_string());
                })?;
                self.claimer.resolve_touch(claim, TouchOutcome::Skipped, now)?;
                metrics::counter!("touches.skipped", "reason" => reason.as_str()).increment(1);
                Ok(ItemOutcome::Skipped)
            }
            GateDecision::Defer { reason, until } => {
                match until {
                    Some(until) => {
                        self.claimer.defer(claim, until)?;
                    }
                    None => self.claimer.release(claim)?,
                }
                debug!(enrollment_id = %claim.enrollment_id, reason = ?reason, until = ?until, "Touch deferred");
                metrics::counter!("touches.deferred").increment(1);
                Ok(ItemOutcome::Deferred)
            }
            GateDecision::Send => match self.executor.execute(&send, now).await? {
                SendResult::Delivered { at, .. } => {
                    self.claimer.resolve_touch(claim, TouchOutcome::Sent { at }, now)?;
                    metrics::counter!("touches.sent", "channel" => channel.as_str()).increment(1);
                    Ok(ItemOutcome::Sent)
                }
                SendResult::Failed { kind, error, .. } => {
                    match kind {
                        FailureKind::Permanent => {
                            if let Some(failed) = self.store.get_send(send.id) {
                                self.alerts.raise(&failed, error, now);
                            }
                        }
                        FailureKind::Retryable => {
                            self.retries.enqueue(
                                send.id,
                                RetryReason::ChannelError,
                                0,
                                None,
                                Some(error),
                                now,
                            )?;
                        }
                    }
                    self.claimer.resolve_touch(claim, TouchOutcome::Failed, now)?;
                    metrics::counter!("touches.failed", "channel" => channel.as_str()).increment(1);
                    Ok(ItemOutcome::Failed)
                }
            },
        }
    }
}
