use std::sync::Arc;
use std::time::Duration as StdDuration;

use campaign_channels::{ChannelDispatcher, ContentComposer};
use campaign_core::types::{
    Business, Campaign, CampaignStatus, Channel, Customer, Job, RetryQueueItem, SmsConsent, StopReason,
};
use campaign_core::{AppConfig, CampaignError, CampaignResult};
use campaign_delivery::{DeliveryGatekeeper, QuietHoursWindow, RateLimiter};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::alerts::{Alert, AlertCenter};
use crate::batch::{BatchRunner, BatchSummary};
use crate::claimer::TouchClaimer;
use crate::conflict::{ConflictResolver, JobOutcome, ResolveAction, SweepReport};
use crate::executor::SendExecutor;
use crate::lifecycle::{LifecycleManager, LifecycleReport};
use crate::retry::RetryQueue;
use crate::store::EngineStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConflictSweepSummary {
    pub queue_after: SweepReport,
    pub stale_conflicts: SweepReport,
}

/// Wires the enrollment components together over one store and exposes
/// the operations the HTTP layer and periodic triggers call.
pub struct SequencerEngine {
    config: AppConfig,
    store: Arc<EngineStore>,
    claimer: Arc<TouchClaimer>,
    lifecycle: Arc<LifecycleManager>,
    conflicts: ConflictResolver,
    retries: Arc<RetryQueue>,
    alerts: Arc<AlertCenter>,
    batch: BatchRunner,
}

impl SequencerEngine {
    pub fn new(
        config: AppConfig,
        store: Arc<EngineStore>,
        dispatcher: ChannelDispatcher,
        composer: Arc<dyn ContentComposer>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        let gatekeeper = Arc::new(DeliveryGatekeeper::new(
            QuietHoursWindow::from_config(&config.quiet_hours),
            limiter,
        ));
        let claimer = Arc::new(TouchClaimer::new(store.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(store.clone()));
        let conflicts = ConflictResolver::new(store.clone(), lifecycle.clone(), &config.conflict);
        let alerts = Arc::new(AlertCenter::new(store.clone(), config.retry.max_attempts));
        let executor = Arc::new(SendExecutor::new(store.clone(), Arc::new(dispatcher), composer));
        let retries = Arc::new(RetryQueue::new(
            store.clone(),
            executor.clone(),
            gatekeeper.clone(),
            claimer.clone(),
            alerts.clone(),
            config.retry.clone(),
        ));
        let batch = BatchRunner::new(
            store.clone(),
            claimer.clone(),
            gatekeeper,
            executor,
            retries.clone(),
            alerts.clone(),
            config.batch.clone(),
        );

        info!(node_id = %config.node_id, "Sequencer engine initialized");
        Self {
            config,
            store,
            claimer,
            lifecycle,
            conflicts,
            retries,
            alerts,
            batch,
        }
    }

    /// Dispatcher with the configured send timeout and no senders.
    pub fn dispatcher_for(config: &AppConfig) -> ChannelDispatcher {
        ChannelDispatcher::new(StdDuration::from_millis(config.batch.send_timeout_ms))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EngineStore> {
        &self.store
    }

    pub fn claimer(&self) -> &TouchClaimer {
        &self.claimer
    }

    pub fn retries(&self) -> &RetryQueue {
        &self.retries
    }

    // ─── Records ───────────────────────────────────────────────────────────

    pub fn put_business(&self, business: Business) -> Business {
        self.store.upsert_business(business.clone());
        business
    }

    /// Insert or replace a campaign definition. A new campaign starts active;
    /// an existing one keeps its status and creation time, which only the
    /// lifecycle operations change.
    pub fn put_campaign(&self, mut campaign: Campaign, now: DateTime<Utc>) -> CampaignResult<Campaign> {
        self.require_owner(campaign.owner_id)?;
        for (idx, touch) in campaign.touches.iter().enumerate() {
            if touch.touch_number != idx as u32 + 1 {
                return Err(CampaignError::Validation(format!(
                    "touch {} is out of sequence at position {}",
                    touch.touch_number,
                    idx + 1
                )));
            }
        }

        match self.store.get_campaign(campaign.id) {
            Some(existing) => {
                if existing.owner_id != campaign.owner_id {
                    return Err(CampaignError::Validation(format!(
                        "campaign {} belongs to another owner",
                        campaign.id
                    )));
                }
                campaign.status = existing.status;
                campaign.created_at = existing.created_at;
            }
            None => {
                campaign.status = CampaignStatus::Active;
                campaign.created_at = now;
            }
        }
        campaign.updated_at = now;
        self.store.upsert_campaign(campaign.clone());
        info!(campaign_id = %campaign.id, touches = campaign.touches.len(), "Campaign stored");
        Ok(campaign)
    }

    pub fn put_customer(&self, customer: Customer) -> CampaignResult<Customer> {
        self.require_owner(customer.owner_id)?;
        if let Some(existing) = self.store.get_customer(customer.id) {
            if existing.owner_id != customer.owner_id {
                return Err(CampaignError::Validation(format!(
                    "customer {} belongs to another owner",
                    customer.id
                )));
            }
        }
        self.store.upsert_customer(customer.clone());
        Ok(customer)
    }

    /// Insert or update a job. Enrollment state already recorded on the job
    /// (resolution, conflict time, created enrollment) is kept.
    pub fn put_job(&self, mut job: Job) -> CampaignResult<Job> {
        self.require_owner(job.owner_id)?;
        let customer = self
            .store
            .get_customer(job.customer_id)
            .ok_or_else(|| CampaignError::not_found("Customer", job.customer_id))?;
        if customer.owner_id != job.owner_id {
            return Err(CampaignError::Validation(format!(
                "customer {} belongs to another owner",
                customer.id
            )));
        }

        if let Some(existing) = self.store.get_job(job.id) {
            if existing.owner_id != job.owner_id || existing.customer_id != job.customer_id {
                return Err(CampaignError::Validation(format!(
                    "job {} cannot move to another owner or customer",
                    job.id
                )));
            }
            job.completed_at = job.completed_at.or(existing.completed_at);
            job.enrollment_resolution = existing.enrollment_resolution;
            job.conflict_detected_at = existing.conflict_detected_at;
            job.enrollment_id = existing.enrollment_id;
        }
        self.store.upsert_job(job.clone());
        Ok(job)
    }

    fn require_owner(&self, owner_id: Uuid) -> CampaignResult<()> {
        self.store
            .get_business(owner_id)
            .map(|_| ())
            .ok_or_else(|| CampaignError::not_found("Business", owner_id))
    }

    // ─── Periodic triggers ─────────────────────────────────────────────────

    /// One pass of touch processing. `limit` defaults to the configured batch size.
    pub async fn run_batch(&self, now: DateTime<Utc>, limit: Option<usize>) -> CampaignResult<BatchSummary> {
        self.batch
            .run_batch(now, limit.unwrap_or(self.config.batch.limit))
            .await
    }

    pub fn run_conflict_sweep(&self, now: DateTime<Utc>) -> ConflictSweepSummary {
        let queue_after = self.conflicts.sweep_queue_after(now);
        let stale_conflicts = self
            .conflicts
            .sweep_stale_conflicts(now, self.conflicts.stale_after());
        ConflictSweepSummary {
            queue_after,
            stale_conflicts,
        }
    }

    // ─── Jobs and conflicts ────────────────────────────────────────────────

    pub fn complete_job(&self, job_id: Uuid, now: DateTime<Utc>) -> CampaignResult<JobOutcome> {
        self.store.update_job(job_id, |j| {
            j.completed_at.get_or_insert(now);
            Ok(())
        })?;
        self.conflicts.on_job_completed(job_id, now)
    }

    pub fn resolve_conflict(&self, job_id: Uuid, action: ResolveAction, now: DateTime<Utc>) -> CampaignResult<()> {
        self.conflicts.resolve(job_id, action, now)
    }

    pub fn revert_conflict(&self, job_id: Uuid, now: DateTime<Utc>) -> CampaignResult<()> {
        self.conflicts.revert(job_id, now)
    }

    pub fn sweep_stale_conflicts(&self, now: DateTime<Utc>, threshold: Duration) -> SweepReport {
        self.conflicts.sweep_stale_conflicts(now, threshold)
    }

    // ─── Campaign lifecycle ────────────────────────────────────────────────

    pub fn pause_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<LifecycleReport> {
        self.lifecycle.pause(campaign_id, now)
    }

    pub fn resume_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<LifecycleReport> {
        self.lifecycle.resume(campaign_id, now)
    }

    pub fn pause_and_stop_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<LifecycleReport> {
        self.lifecycle.pause_and_stop(campaign_id, now)
    }

    pub fn delete_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<LifecycleReport> {
        self.lifecycle.delete(campaign_id, now)
    }

    pub fn stop_enrollment(&self, enrollment_id: Uuid, reason: StopReason, now: DateTime<Utc>) -> CampaignResult<bool> {
        self.lifecycle.stop(enrollment_id, reason, now)
    }

    pub fn stop_for_customer(
        &self,
        owner_id: Uuid,
        customer_id: Uuid,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> CampaignResult<Option<Uuid>> {
        self.lifecycle
            .stop_for_customer(owner_id, customer_id, reason, now)
    }

    /// Record a channel opt-out on the customer and stop their live sequence.
    pub fn opt_out(&self, customer_id: Uuid, channel: Channel, now: DateTime<Utc>) -> CampaignResult<Option<Uuid>> {
        let owner_id = self.store.update_customer(customer_id, |c| {
            match channel {
                Channel::Email => c.opted_out = true,
                Channel::Sms => c.sms_consent = SmsConsent::OptedOut,
            }
            c.owner_id
        })?;
        let reason = match channel {
            Channel::Email => StopReason::OptedOutEmail,
            Channel::Sms => StopReason::OptedOutSms,
        };
        self.lifecycle
            .stop_for_customer(owner_id, customer_id, reason, now)
    }

    // ─── Alerts ────────────────────────────────────────────────────────────

    pub fn retry_alert(&self, alert_id: Uuid, now: DateTime<Utc>) -> CampaignResult<RetryQueueItem> {
        self.alerts.retry(alert_id, now)
    }

    pub fn acknowledge_alert(&self, alert_id: Uuid, now: DateTime<Utc>) -> CampaignResult<Alert> {
        self.alerts.acknowledge(alert_id, now)
    }
}
