//! Enrollment creation: campaign matching and first-touch anchoring.

use std::sync::Arc;

use campaign_core::types::{
    Campaign, Enrollment, EnrollmentStatus, Job, TouchRecord, TouchStatus,
};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::store::EngineStore;

pub struct Enroller {
    store: Arc<EngineStore>,
}

impl Enroller {
    pub fn new(store: Arc<EngineStore>) -> Self {
        Self { store }
    }

    /// An active campaign for the job's service type, else the owner's
    /// all-services campaign. Oldest wins on ties.
    pub fn match_campaign(&self, owner_id: Uuid, service_type: &str) -> Option<Campaign> {
        let campaigns: Vec<Campaign> = self
            .store
            .campaigns_for_owner(owner_id)
            .into_iter()
            .filter(|c| c.is_active() && !c.touches.is_empty())
            .collect();

        campaigns
            .iter()
            .find(|c| c.service_type.as_deref() == Some(service_type))
            .or_else(|| campaigns.iter().find(|c| c.service_type.is_none()))
            .cloned()
    }

    /// Hours until touch 1: the business's timing for this service type,
    /// falling back to the campaign's own touch-1 delay.
    pub fn first_touch_delay_hours(&self, job: &Job, campaign: &Campaign) -> u32 {
        self.store
            .get_business(job.owner_id)
            .and_then(|b| b.service_type_timing.get(&job.service_type).copied())
            .or_else(|| campaign.touch(1).map(|t| t.delay_hours))
            .unwrap_or(0)
    }

    /// Build a fresh enrollment with touch 1 scheduled and later touches
    /// left unscheduled.
    pub fn build(&self, job: &Job, campaign: &Campaign, now: DateTime<Utc>) -> CampaignResult<Enrollment> {
        if campaign.touches.is_empty() {
            return Err(CampaignError::Validation(format!(
                "campaign {} has no touches",
                campaign.id
            )));
        }
        let delay = self.first_touch_delay_hours(job, campaign);
        let mut touches = vec![TouchRecord::unscheduled(); campaign.touches.len()];
        touches[0] = TouchRecord {
            scheduled_at: Some(now + Duration::hours(i64::from(delay))),
            sent_at: None,
            status: TouchStatus::Pending,
        };

        Ok(Enrollment {
            id: Uuid::new_v4(),
            owner_id: job.owner_id,
            campaign_id: campaign.id,
            job_id: job.id,
            customer_id: job.customer_id,
            status: EnrollmentStatus::Active,
            stop_reason: None,
            current_touch: 1,
            touches,
            enrolled_at: now,
            completed_at: None,
            stopped_at: None,
            claimed_at: None,
        })
    }

    /// Enroll the job's customer in its matching campaign and clear the job's
    /// conflict markers. `Ok(None)` when no campaign matches; a `Conflict`
    /// error when the customer already holds a live enrollment.
    pub fn enroll(&self, job: &Job, now: DateTime<Utc>) -> CampaignResult<Option<Enrollment>> {
        let Some(campaign) = self.match_campaign(job.owner_id, &job.service_type) else {
            return Ok(None);
        };
        let enrollment = self.build(job, &campaign, now)?;
        self.store.insert_enrollment(enrollment.clone())?;

        let enrollment_id = enrollment.id;
        self.store.update_job(job.id, |j| {
            j.enrollment_id = Some(enrollment_id);
            j.enrollment_resolution = None;
            j.conflict_detected_at = None;
            Ok(())
        })?;

        info!(
            enrollment_id = %enrollment.id,
            campaign_id = %campaign.id,
            customer_id = %job.customer_id,
            job_id = %job.id,
            "Customer enrolled"
        );
        metrics::counter!("enrollments.created").increment(1);
        Ok(Some(enrollment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::{Business, CampaignStatus, Channel, TouchDefinition};

    fn campaign(owner: Uuid, service_type: Option<&str>, delays: &[u32]) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Review request".to_string(),
            service_type: service_type.map(str::to_string),
            status: CampaignStatus::Active,
            touches: delays
                .iter()
                .enumerate()
                .map(|(i, d)| TouchDefinition {
                    touch_number: i as u32 + 1,
                    channel: Channel::Email,
                    delay_hours: *d,
                    content_ref: format!("touch-{}", i + 1),
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    fn job(owner: Uuid, service_type: &str) -> Job {
        Job {
            id: Uuid::new_v4(),
            owner_id: owner,
            customer_id: Uuid::new_v4(),
            service_type: service_type.to_string(),
            completed_at: Some(Utc::now()),
            enrollment_resolution: None,
            conflict_detected_at: None,
            enrollment_id: None,
        }
    }

    #[test]
    fn test_service_specific_campaign_preferred() {
        let store = Arc::new(EngineStore::new());
        let owner = Uuid::new_v4();
        let general = campaign(owner, None, &[24]);
        let hvac = campaign(owner, Some("hvac"), &[2]);
        store.upsert_campaign(general.clone());
        store.upsert_campaign(hvac.clone());
        let enroller = Enroller::new(store);

        assert_eq!(enroller.match_campaign(owner, "hvac").unwrap().id, hvac.id);
        assert_eq!(enroller.match_campaign(owner, "plumbing").unwrap().id, general.id);
        assert!(enroller.match_campaign(Uuid::new_v4(), "hvac").is_none());
    }

    #[test]
    fn test_paused_campaign_not_matched() {
        let store = Arc::new(EngineStore::new());
        let owner = Uuid::new_v4();
        let mut paused = campaign(owner, None, &[24]);
        paused.status = CampaignStatus::Paused;
        store.upsert_campaign(paused);
        assert!(Enroller::new(store).match_campaign(owner, "hvac").is_none());
    }

    #[test]
    fn test_first_touch_anchoring() {
        let store = Arc::new(EngineStore::new());
        let owner = Uuid::new_v4();
        let c = campaign(owner, None, &[24, 48, 72]);
        store.upsert_campaign(c.clone());
        let mut timing = std::collections::HashMap::new();
        timing.insert("roofing".to_string(), 4);
        store.upsert_business(Business {
            id: owner,
            name: "Acme".to_string(),
            timezone: None,
            service_type_timing: timing,
        });
        let enroller = Enroller::new(store.clone());
        let now = Utc::now();

        let roof = job(owner, "roofing");
        store.upsert_job(roof.clone());
        let e = enroller.enroll(&roof, now).unwrap().unwrap();
        assert_eq!(e.touches.len(), 3);
        assert_eq!(e.touches[0].scheduled_at, Some(now + Duration::hours(4)));
        assert!(e.touches[1].scheduled_at.is_none());
        assert_eq!(store.get_job(roof.id).unwrap().enrollment_id, Some(e.id));

        let other = job(owner, "gutters");
        store.upsert_job(other.clone());
        let e = enroller.enroll(&other, now).unwrap().unwrap();
        assert_eq!(e.touches[0].scheduled_at, Some(now + Duration::hours(24)));
    }
}
