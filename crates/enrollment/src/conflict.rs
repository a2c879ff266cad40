//! Conflict resolver — decides what happens when a completed job would
//! enroll a customer who is already in a live sequence.

use std::sync::Arc;

use campaign_core::config::ConflictConfig;
use campaign_core::types::{EnrollmentResolution, Job, StopReason};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::enroller::Enroller;
use crate::lifecycle::LifecycleManager;
use crate::store::EngineStore;

/// Manual resolution for a job held in conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolveAction {
    /// Stop the existing sequence and enroll this job now.
    Replace,
    /// Never enroll this job.
    Skip,
    /// Enroll once the existing sequence ends and the cooldown has passed.
    QueueAfter,
    /// Enroll as soon as the existing sequence ends.
    ReplaceOnComplete,
}

/// Result of a job-completion event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobOutcome {
    Enrolled { enrollment_id: Uuid },
    /// The job already created an enrollment.
    AlreadyEnrolled { enrollment_id: Uuid },
    /// Held for resolution; the customer is in `existing_enrollment_id`.
    Conflict { existing_enrollment_id: Uuid },
    /// The job already carries a resolution and is waiting on it.
    Held { resolution: EnrollmentResolution },
    /// Skipped or suppressed jobs never enroll.
    Excluded { resolution: EnrollmentResolution },
    NoCampaign,
}

/// Tally of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SweepReport {
    pub processed: usize,
    pub enrolled: usize,
    pub suppressed: usize,
    pub waiting: usize,
    pub errors: usize,
}

pub struct ConflictResolver {
    store: Arc<EngineStore>,
    enroller: Enroller,
    lifecycle: Arc<LifecycleManager>,
    cooldown: Duration,
    stale_after: Duration,
}

impl ConflictResolver {
    pub fn new(store: Arc<EngineStore>, lifecycle: Arc<LifecycleManager>, config: &ConflictConfig) -> Self {
        Self {
            enroller: Enroller::new(store.clone()),
            store,
            lifecycle,
            cooldown: Duration::days(config.cooldown_days),
            stale_after: Duration::hours(config.stale_conflict_hours),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Handle a job-completion event: enroll, or hold the job in conflict if
    /// the customer is already in a live sequence.
    pub fn on_job_completed(&self, job_id: Uuid, now: DateTime<Utc>) -> CampaignResult<JobOutcome> {
        let job = self.job(job_id)?;

        if let Some(enrollment_id) = job.enrollment_id {
            return Ok(JobOutcome::AlreadyEnrolled { enrollment_id });
        }
        match job.enrollment_resolution {
            Some(r @ (EnrollmentResolution::Skipped | EnrollmentResolution::Suppressed)) => {
                return Ok(JobOutcome::Excluded { resolution: r });
            }
            Some(resolution) => return Ok(JobOutcome::Held { resolution }),
            None => {}
        }

        if self.enroller.match_campaign(job.owner_id, &job.service_type).is_none() {
            debug!(job_id = %job.id, service_type = %job.service_type, "No campaign for job");
            return Ok(JobOutcome::NoCampaign);
        }

        if let Some(existing) = self.store.live_enrollment_for(job.owner_id, job.customer_id) {
            self.mark_conflict(&job, existing.id, now)?;
            return Ok(JobOutcome::Conflict {
                existing_enrollment_id: existing.id,
            });
        }

        match self.enroller.enroll(&job, now) {
            Ok(Some(enrollment)) => Ok(JobOutcome::Enrolled {
                enrollment_id: enrollment.id,
            }),
            Ok(None) => Ok(JobOutcome::NoCampaign),
            // Lost a race with another enrollment for the same customer
            Err(CampaignError::Conflict(_)) => {
                match self.store.live_enrollment_for(job.owner_id, job.customer_id) {
                    Some(existing) => {
                        self.mark_conflict(&job, existing.id, now)?;
                        Ok(JobOutcome::Conflict {
                            existing_enrollment_id: existing.id,
                        })
                    }
                    None => Err(CampaignError::Conflict(format!(
                        "enrollment for job {} raced and lost",
                        job.id
                    ))),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Apply a manual resolution. Repeating the action the job already
    /// reflects is a successful no-op.
    pub fn resolve(&self, job_id: Uuid, action: ResolveAction, now: DateTime<Utc>) -> CampaignResult<()> {
        let job = self.job(job_id)?;

        let already = match action {
            ResolveAction::Replace => job.enrollment_resolution.is_none() && job.enrollment_id.is_some(),
            ResolveAction::Skip => job.enrollment_resolution == Some(EnrollmentResolution::Skipped),
            ResolveAction::QueueAfter => job.enrollment_resolution == Some(EnrollmentResolution::QueueAfter),
            ResolveAction::ReplaceOnComplete => {
                job.enrollment_resolution == Some(EnrollmentResolution::ReplaceOnComplete)
            }
        };
        if already {
            debug!(job_id = %job_id, action = ?action, "Resolution already applied");
            return Ok(());
        }

        if !matches!(
            job.enrollment_resolution,
            Some(
                EnrollmentResolution::Conflict
                    | EnrollmentResolution::QueueAfter
                    | EnrollmentResolution::ReplaceOnComplete
            )
        ) {
            return Err(CampaignError::Validation(format!(
                "job {job_id} has no pending conflict"
            )));
        }

        match action {
            ResolveAction::Replace => self.replace(&job, now)?,
            ResolveAction::Skip => self.set_resolution(job_id, Some(EnrollmentResolution::Skipped))?,
            ResolveAction::QueueAfter => self.set_resolution(job_id, Some(EnrollmentResolution::QueueAfter))?,
            ResolveAction::ReplaceOnComplete => {
                self.set_resolution(job_id, Some(EnrollmentResolution::ReplaceOnComplete))?
            }
        }

        info!(job_id = %job_id, action = ?action, "Conflict resolved");
        metrics::counter!("conflicts.resolved").increment(1);
        Ok(())
    }

    /// Undo a skip or queue decision. If the customer is still in a live
    /// sequence the job goes back to conflict; otherwise the conflict is gone
    /// and the resolution is cleared.
    pub fn revert(&self, job_id: Uuid, now: DateTime<Utc>) -> CampaignResult<()> {
        let job = self.job(job_id)?;
        if job.enrollment_resolution.is_none() {
            return Err(CampaignError::Validation(format!(
                "job {job_id} has no resolution to revert"
            )));
        }

        let still_live = self
            .store
            .live_enrollment_for(job.owner_id, job.customer_id)
            .is_some();
        self.store.update_job(job_id, |j| {
            if still_live {
                j.enrollment_resolution = Some(EnrollmentResolution::Conflict);
                j.conflict_detected_at.get_or_insert(now);
            } else {
                j.enrollment_resolution = None;
                j.conflict_detected_at = None;
            }
            Ok(())
        })?;

        info!(job_id = %job_id, back_to_conflict = still_live, "Conflict resolution reverted");
        Ok(())
    }

    /// Enroll queued jobs whose blocking sequence has ended.
    pub fn sweep_queue_after(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut queued = self.store.jobs_with_resolution(EnrollmentResolution::QueueAfter);
        queued.extend(self.store.jobs_with_resolution(EnrollmentResolution::ReplaceOnComplete));

        for job in queued {
            report.processed += 1;
            if self
                .store
                .live_enrollment_for(job.owner_id, job.customer_id)
                .is_some()
            {
                report.waiting += 1;
                continue;
            }

            if job.enrollment_resolution == Some(EnrollmentResolution::QueueAfter) {
                if let Some(ended) = self.store.latest_ended_enrollment(job.owner_id, job.customer_id) {
                    if ended.stop_reason.map(|r| r.is_success()).unwrap_or(false) {
                        match self.set_resolution(job.id, Some(EnrollmentResolution::Suppressed)) {
                            Ok(()) => {
                                info!(job_id = %job.id, "Queued job suppressed after successful sequence");
                                report.suppressed += 1;
                            }
                            Err(err) => {
                                warn!(job_id = %job.id, error = %err, "Failed to suppress queued job");
                                report.errors += 1;
                            }
                        }
                        continue;
                    }
                    let ended_at = ended.ended_at().unwrap_or(ended.enrolled_at);
                    if now - ended_at < self.cooldown {
                        report.waiting += 1;
                        continue;
                    }
                }
            }

            match self.enroller.enroll(&job, now) {
                Ok(Some(_)) => report.enrolled += 1,
                Ok(None) | Err(CampaignError::Conflict(_)) => report.waiting += 1,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "Queued enrollment failed");
                    report.errors += 1;
                }
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                enrolled = report.enrolled,
                suppressed = report.suppressed,
                "Queue-after sweep finished"
            );
        }
        report
    }

    /// Resolve conflicts nobody acted on within the threshold as `replace`.
    pub fn sweep_stale_conflicts(&self, now: DateTime<Utc>, threshold: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = now - threshold;

        for job in self.store.jobs_with_resolution(EnrollmentResolution::Conflict) {
            report.processed += 1;
            let detected = job.conflict_detected_at.or(job.completed_at).unwrap_or(now);
            if detected > cutoff {
                report.waiting += 1;
                continue;
            }
            match self.replace(&job, now) {
                Ok(()) => {
                    info!(job_id = %job.id, "Stale conflict auto-resolved as replace");
                    report.enrolled += 1;
                }
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "Stale conflict auto-resolution failed");
                    report.errors += 1;
                }
            }
        }
        report
    }

    fn replace(&self, job: &Job, now: DateTime<Utc>) -> CampaignResult<()> {
        if self.enroller.match_campaign(job.owner_id, &job.service_type).is_none() {
            return Err(CampaignError::Validation(format!(
                "no active campaign matches job {}",
                job.id
            )));
        }
        self.lifecycle
            .stop_for_customer(job.owner_id, job.customer_id, StopReason::RepeatJob, now)?;
        match self.enroller.enroll(job, now)? {
            Some(_) => Ok(()),
            None => Err(CampaignError::Validation(format!(
                "no active campaign matches job {}",
                job.id
            ))),
        }
    }

    fn mark_conflict(&self, job: &Job, existing: Uuid, now: DateTime<Utc>) -> CampaignResult<()> {
        self.store.update_job(job.id, |j| {
            j.enrollment_resolution = Some(EnrollmentResolution::Conflict);
            j.conflict_detected_at = Some(now);
            Ok(())
        })?;
        info!(
            job_id = %job.id,
            customer_id = %job.customer_id,
            existing_enrollment_id = %existing,
            "Enrollment conflict detected"
        );
        metrics::counter!("conflicts.detected").increment(1);
        Ok(())
    }

    fn set_resolution(&self, job_id: Uuid, resolution: Option<EnrollmentResolution>) -> CampaignResult<()> {
        self.store.update_job(job_id, |j| {
            j.enrollment_resolution = resolution;
            Ok(())
        })
    }

    fn job(&self, job_id: Uuid) -> CampaignResult<Job> {
        self.store
            .get_job(job_id)
            .ok_or_else(|| CampaignError::not_found("Job", job_id))
    }
}
