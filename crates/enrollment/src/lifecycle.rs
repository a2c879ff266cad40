//! Campaign lifecycle — pause freezes, resume thaws, stop and delete end.

use std::sync::Arc;

use campaign_core::types::{CampaignStatus, EnrollmentStatus, RetryStatus, StopReason};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state_machine::EnrollmentStateMachine;
use crate::store::EngineStore;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LifecycleReport {
    pub campaign_id: Uuid,
    /// Enrollments whose status changed.
    pub enrollments_affected: usize,
}

pub struct LifecycleManager {
    store: Arc<EngineStore>,
    state_machine: EnrollmentStateMachine,
}

impl LifecycleManager {
    pub fn new(store: Arc<EngineStore>) -> Self {
        Self {
            store,
            state_machine: EnrollmentStateMachine::new(),
        }
    }

    /// Pause the campaign and freeze its active enrollments, leaving their
    /// position and timestamps untouched.
    pub fn pause(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<LifecycleReport> {
        self.set_campaign_status(campaign_id, CampaignStatus::Paused, now)?;

        let mut affected = 0;
        for enrollment in self.store.enrollments_for_campaign(campaign_id) {
            if enrollment.status != EnrollmentStatus::Active {
                continue;
            }
            let frozen = self.store.update_enrollment(enrollment.id, |e| {
                if e.status != EnrollmentStatus::Active {
                    return Ok(false);
                }
                self.state_machine.transition(&mut e.status, EnrollmentStatus::Frozen)?;
                Ok(true)
            })?;
            if frozen {
                affected += 1;
            }
        }

        info!(campaign_id = %campaign_id, frozen = affected, "Campaign paused");
        Ok(LifecycleReport {
            campaign_id,
            enrollments_affected: affected,
        })
    }

    /// Reactivate the campaign and thaw its frozen enrollments. A current
    /// touch whose time passed during the pause becomes due `now`.
    pub fn resume(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<LifecycleReport> {
        self.set_campaign_status(campaign_id, CampaignStatus::Active, now)?;

        let mut affected = 0;
        for enrollment in self.store.enrollments_for_campaign(campaign_id) {
            if enrollment.status != EnrollmentStatus::Frozen {
                continue;
            }
            let thawed = self.store.update_enrollment(enrollment.id, |e| {
                if e.status != EnrollmentStatus::Frozen {
                    return Ok(false);
                }
                self.state_machine.transition(&mut e.status, EnrollmentStatus::Active)?;
                if let Some(touch) = e.current_mut() {
                    match touch.scheduled_at {
                        Some(at) if at >= now => {}
                        _ => touch.scheduled_at = Some(now),
                    }
                }
                Ok(true)
            })?;
            if thawed {
                affected += 1;
            }
        }

        info!(campaign_id = %campaign_id, resumed = affected, "Campaign resumed");
        Ok(LifecycleReport {
            campaign_id,
            enrollments_affected: affected,
        })
    }

    /// Pause the campaign and stop its live enrollments outright.
    pub fn pause_and_stop(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<LifecycleReport> {
        self.set_campaign_status(campaign_id, CampaignStatus::Paused, now)?;
        let affected = self.stop_campaign_enrollments(campaign_id, StopReason::CampaignPaused, now)?;
        info!(campaign_id = %campaign_id, stopped = affected, "Campaign paused and enrollments stopped");
        Ok(LifecycleReport {
            campaign_id,
            enrollments_affected: affected,
        })
    }

    /// Stop every live enrollment and remove the campaign definition.
    /// Ended enrollments stay as history.
    pub fn delete(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<LifecycleReport> {
        if self.store.get_campaign(campaign_id).is_none() {
            return Err(CampaignError::not_found("Campaign", campaign_id));
        }
        let affected = self.stop_campaign_enrollments(campaign_id, StopReason::CampaignDeleted, now)?;
        self.store.remove_campaign(campaign_id);
        info!(campaign_id = %campaign_id, stopped = affected, "Campaign deleted");
        Ok(LifecycleReport {
            campaign_id,
            enrollments_affected: affected,
        })
    }

    /// Stop one enrollment. Returns `false` if it had already ended.
    pub fn stop(&self, enrollment_id: Uuid, reason: StopReason, now: DateTime<Utc>) -> CampaignResult<bool> {
        let stopped = self.store.update_enrollment(enrollment_id, |e| {
            if e.status.is_terminal() {
                return Ok(false);
            }
            self.state_machine.transition(&mut e.status, EnrollmentStatus::Stopped)?;
            e.stop_reason = Some(reason);
            e.stopped_at = Some(now);
            e.claimed_at = None;
            Ok(true)
        })?;

        if stopped {
            let cancelled = self.cancel_pending_retries(enrollment_id)?;
            info!(
                enrollment_id = %enrollment_id,
                reason = ?reason,
                retries_cancelled = cancelled,
                "Enrollment stopped"
            );
            metrics::counter!("enrollments.stopped").increment(1);
        }
        Ok(stopped)
    }

    /// Stop the customer's live enrollment under `owner_id`, if any.
    pub fn stop_for_customer(
        &self,
        owner_id: Uuid,
        customer_id: Uuid,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> CampaignResult<Option<Uuid>> {
        let Some(live) = self.store.live_enrollment_for(owner_id, customer_id) else {
            return Ok(None);
        };
        Ok(self.stop(live.id, reason, now)?.then_some(live.id))
    }

    fn stop_campaign_enrollments(
        &self,
        campaign_id: Uuid,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> CampaignResult<usize> {
        let mut affected = 0;
        for enrollment in self.store.enrollments_for_campaign(campaign_id) {
            if enrollment.status.is_live() && self.stop(enrollment.id, reason, now)? {
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn cancel_pending_retries(&self, enrollment_id: Uuid) -> CampaignResult<usize> {
        let mut cancelled = 0;
        for send in self.store.sends_for_enrollment(enrollment_id) {
            for item in self.store.retries_for_send(send.id) {
                if item.status != RetryStatus::Pending {
                    continue;
                }
                let changed = self.store.update_retry(item.id, |r| {
                    if r.status == RetryStatus::Pending {
                        r.status = RetryStatus::Cancelled;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                })?;
                if changed {
                    debug!(retry_id = %item.id, "Retry cancelled with its enrollment");
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }

    fn set_campaign_status(&self, campaign_id: Uuid, status: CampaignStatus, now: DateTime<Utc>) -> CampaignResult<()> {
        self.store.update_campaign(campaign_id, |c| {
            c.status = status;
            c.updated_at = now;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::{Campaign, Channel, Enrollment, TouchDefinition, TouchRecord, TouchStatus};
    use chrono::Duration;

    fn setup(scheduled: DateTime<Utc>) -> (Arc<EngineStore>, Campaign, Enrollment) {
        let store = Arc::new(EngineStore::new());
        let owner = Uuid::new_v4();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Reviews".to_string(),
            service_type: None,
            status: CampaignStatus::Active,
            touches: vec![
                TouchDefinition {
                    touch_number: 1,
                    channel: Channel::Email,
                    delay_hours: 1,
                    content_ref: "a".to_string(),
                },
                TouchDefinition {
                    touch_number: 2,
                    channel: Channel::Sms,
                    delay_hours: 24,
                    content_ref: "b".to_string(),
                },
            ],
            created_at: scheduled,
            updated_at: scheduled,
        };
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            owner_id: owner,
            campaign_id: campaign.id,
            job_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            status: EnrollmentStatus::Active,
            stop_reason: None,
            current_touch: 2,
            touches: vec![
                TouchRecord {
                    scheduled_at: Some(scheduled - Duration::hours(24)),
                    sent_at: Some(scheduled - Duration::hours(24)),
                    status: TouchStatus::Sent,
                },
                TouchRecord {
                    scheduled_at: Some(scheduled),
                    sent_at: None,
                    status: TouchStatus::Pending,
                },
            ],
            enrolled_at: scheduled - Duration::hours(25),
            completed_at: None,
            stopped_at: None,
            claimed_at: None,
        };
        store.upsert_campaign(campaign.clone());
        store.insert_enrollment(enrollment.clone()).unwrap();
        (store, campaign, enrollment)
    }

    #[test]
    fn test_pause_freezes_without_losing_position() {
        let now = Utc::now();
        let (store, campaign, enrollment) = setup(now + Duration::hours(2));
        let manager = LifecycleManager::new(store.clone());

        let report = manager.pause(campaign.id, now).unwrap();
        assert_eq!(report.enrollments_affected, 1);
        let frozen = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(frozen.status, EnrollmentStatus::Frozen);
        assert_eq!(frozen.touches, enrollment.touches);
        assert_eq!(store.get_campaign(campaign.id).unwrap().status, CampaignStatus::Paused);
    }

    #[test]
    fn test_resume_bumps_past_schedule_to_now() {
        let now = Utc::now();
        let (store, campaign, enrollment) = setup(now + Duration::hours(2));
        let manager = LifecycleManager::new(store.clone());
        manager.pause(campaign.id, now).unwrap();

        let later = now + Duration::days(3);
        manager.resume(campaign.id, later).unwrap();
        let e = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.current_touch, 2);
        assert_eq!(e.touches[1].scheduled_at, Some(later));
        assert_eq!(e.touches[0], enrollment.touches[0]);
    }

    #[test]
    fn test_stop_is_idempotent_and_frees_slot() {
        let now = Utc::now();
        let (store, _, enrollment) = setup(now);
        let manager = LifecycleManager::new(store.clone());
        assert!(manager.stop(enrollment.id, StopReason::OwnerStopped, now).unwrap());
        assert!(!manager.stop(enrollment.id, StopReason::ReviewClicked, now).unwrap());

        let e = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(e.stop_reason, Some(StopReason::OwnerStopped));
        assert!(store.live_enrollment_for(e.owner_id, e.customer_id).is_none());
    }

    #[test]
    fn test_delete_stops_and_removes() {
        let now = Utc::now();
        let (store, campaign, enrollment) = setup(now);
        let manager = LifecycleManager::new(store.clone());
        let report = manager.delete(campaign.id, now).unwrap();
        assert_eq!(report.enrollments_affected, 1);
        assert!(store.get_campaign(campaign.id).is_none());
        let e = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(e.stop_reason, Some(StopReason::CampaignDeleted));
        assert!(matches!(
            manager.delete(campaign.id, now),
            Err(CampaignError::NotFound { .. })
        ));
    }

    #[test]
    fn test_pause_and_stop() {
        let now = Utc::now();
        let (store, campaign, enrollment) = setup(now);
        LifecycleManager::new(store.clone())
            .pause_and_stop(campaign.id, now)
            .unwrap();
        let e = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Stopped);
        assert_eq!(e.stop_reason, Some(StopReason::CampaignPaused));
    }
}
