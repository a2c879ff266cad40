//! Touch claimer — atomically hands due touches to exactly one worker and
//! advances the enrollment once a touch is resolved.
//!
//! A claim is a lease stamped on the enrollment (`claimed_at`). Taking it is
//! a compare-and-swap under the enrollment's entry lock: only a due touch
//! with no live lease can be claimed, so overlapping batch runs never select
//! the same touch twice.

use std::sync::Arc;

use campaign_core::types::{EnrollmentStatus, StopReason, TouchStatus};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state_machine::EnrollmentStateMachine;
use crate::store::EngineStore;

/// A due touch owned by the caller until resolved, deferred or released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedTouch {
    pub enrollment_id: Uuid,
    pub campaign_id: Uuid,
    pub owner_id: Uuid,
    pub customer_id: Uuid,
    pub job_id: Uuid,
    pub touch_number: u32,
    pub scheduled_at: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TouchOutcome {
    Sent { at: DateTime<Utc> },
    Skipped,
    Failed,
}

impl TouchOutcome {
    fn status(&self) -> TouchStatus {
        match self {
            TouchOutcome::Sent { .. } => TouchStatus::Sent,
            TouchOutcome::Skipped => TouchStatus::Skipped,
            TouchOutcome::Failed => TouchStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Moved on to `touch`, due at `scheduled_at`.
    Next {
        touch: u32,
        scheduled_at: DateTime<Utc>,
    },
    Completed,
    /// The campaign definition is gone; the enrollment was stopped.
    Stopped,
    /// The enrollment already moved past this touch or ended.
    Stale,
}

pub struct TouchClaimer {
    store: Arc<EngineStore>,
    state_machine: EnrollmentStateMachine,
}

impl TouchClaimer {
    pub fn new(store: Arc<EngineStore>) -> Self {
        Self {
            store,
            state_machine: EnrollmentStateMachine::new(),
        }
    }

    /// Claim up to `limit` due touches, earliest scheduled first.
    pub fn claim_due_touches(&self, now: DateTime<Utc>, limit: usize) -> CampaignResult<Vec<ClaimedTouch>> {
        let mut claimed = Vec::new();
        if limit == 0 {
            return Ok(claimed);
        }

        for (enrollment_id, _) in self.store.due_enrollments(now) {
            let claim = self
                .store
                .update_enrollment(enrollment_id, |e| {
                    if e.claimed_at.is_some() || !e.is_due(now) {
                        return Ok(None);
                    }
                    let scheduled_at = e
                        .current()
                        .and_then(|t| t.scheduled_at)
                        .ok_or_else(|| CampaignError::Claim(format!("enrollment {} has no schedule", e.id)))?;
                    e.claimed_at = Some(now);
                    Ok(Some(ClaimedTouch {
                        enrollment_id: e.id,
                        campaign_id: e.campaign_id,
                        owner_id: e.owner_id,
                        customer_id: e.customer_id,
                        job_id: e.job_id,
                        touch_number: e.current_touch,
                        scheduled_at,
                        claimed_at: now,
                    }))
                })
                .map_err(|err| CampaignError::Claim(err.to_string()))?;

            if let Some(claim) = claim {
                claimed.push(claim);
                if claimed.len() >= limit {
                    break;
                }
            }
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Touches claimed");
            metrics::counter!("touches.claimed").increment(claimed.len() as u64);
        }
        Ok(claimed)
    }

    /// Release leases older than `stale`. Returns how many were recovered.
    pub fn recover_stuck(&self, now: DateTime<Utc>, stale: Duration) -> CampaignResult<usize> {
        let cutoff = now - stale;
        let mut recovered = 0;
        for id in self.store.enrollments_claimed_before(cutoff) {
            let released = self.store.update_enrollment(id, |e| {
                match e.claimed_at {
                    Some(at) if at < cutoff => {
                        e.claimed_at = None;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })?;
            if released {
                warn!(enrollment_id = %id, "Recovered stuck touch claim");
                recovered += 1;
            }
        }
        if recovered > 0 {
            metrics::counter!("touches.recovered").increment(recovered as u64);
        }
        Ok(recovered)
    }

    /// Record the claimed touch's outcome and advance the sequence. Every
    /// outcome advances; the next touch is anchored to the claimed touch's
    /// scheduled time plus the next touch's delay. An enrollment whose
    /// campaign definition is gone is stopped rather than left in place.
    pub fn resolve_touch(
        &self,
        claim: &ClaimedTouch,
        outcome: TouchOutcome,
        now: DateTime<Utc>,
    ) -> CampaignResult<Advance> {
        let campaign = self.store.get_campaign(claim.campaign_id);

        let advance = self.store.update_enrollment(claim.enrollment_id, |e| {
            if e.status.is_terminal() || e.current_touch != claim.touch_number {
                return Ok(Advance::Stale);
            }

            {
                let touch = e
                    .current_mut()
                    .ok_or_else(|| CampaignError::Validation(format!("enrollment {} has no current touch", claim.enrollment_id)))?;
                touch.status = outcome.status();
                if let TouchOutcome::Sent { at } = outcome {
                    touch.sent_at = Some(at);
                }
            }
            e.claimed_at = None;

            let Some(campaign) = campaign.as_ref() else {
                let mut status = e.status;
                self.state_machine.transition(&mut status, EnrollmentStatus::Stopped)?;
                e.status = status;
                e.stop_reason = Some(StopReason::CampaignDeleted);
                e.stopped_at = Some(now);
                return Ok(Advance::Stopped);
            };

            let next_number = claim.touch_number + 1;
            let next_delay = if next_number > e.total_touches() {
                None
            } else {
                campaign.touch(next_number).map(|t| t.delay_hours)
            };
            let Some(delay) = next_delay else {
                let mut status = e.status;
                self.state_machine.transition(&mut status, EnrollmentStatus::Completed)?;
                e.status = status;
                e.completed_at = Some(now);
                return Ok(Advance::Completed);
            };

            let scheduled_at = claim.scheduled_at + Duration::hours(i64::from(delay));
            if let Some(next) = e.touch_mut(next_number) {
                next.scheduled_at = Some(scheduled_at);
                next.status = TouchStatus::Pending;
            }
            e.current_touch = next_number;
            Ok(Advance::Next {
                touch: next_number,
                scheduled_at,
            })
        })?;

        match advance {
            Advance::Completed => {
                info!(enrollment_id = %claim.enrollment_id, "Enrollment completed");
                metrics::counter!("enrollments.completed").increment(1);
            }
            Advance::Next { touch, scheduled_at } => {
                debug!(enrollment_id = %claim.enrollment_id, touch, %scheduled_at, "Enrollment advanced");
            }
            Advance::Stopped => {
                warn!(enrollment_id = %claim.enrollment_id, campaign_id = %claim.campaign_id, "Campaign definition missing, enrollment stopped");
                metrics::counter!("enrollments.stopped").increment(1);
            }
            Advance::Stale => {
                debug!(enrollment_id = %claim.enrollment_id, touch = claim.touch_number, "Stale touch resolution ignored");
            }
        }
        Ok(advance)
    }

    /// Push the claimed touch to `until` and drop the lease. The touch stays
    /// pending and becomes claimable again once due.
    pub fn defer(&self, claim: &ClaimedTouch, until: DateTime<Utc>) -> CampaignResult<bool> {
        self.store.update_enrollment(claim.enrollment_id, |e| {
            if e.current_touch != claim.touch_number {
                return Ok(false);
            }
            e.claimed_at = None;
            match e.current_mut() {
                Some(touch) if touch.status == TouchStatus::Pending => {
                    touch.scheduled_at = Some(until);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    /// Drop the lease without touching the schedule.
    pub fn release(&self, claim: &ClaimedTouch) -> CampaignResult<()> {
        self.store.update_enrollment(claim.enrollment_id, |e| {
            if e.current_touch == claim.touch_number {
                e.claimed_at = None;
            }
            Ok(())
        })
    }

    /// Mirror a late successful delivery onto the touch record.
    pub fn mark_touch_sent(&self, enrollment_id: Uuid, touch_number: u32, at: DateTime<Utc>) -> CampaignResult<()> {
        self.store.update_enrollment(enrollment_id, |e| {
            if let Some(touch) = e.touch_mut(touch_number) {
                if touch.status != TouchStatus::Sent {
                    touch.status = TouchStatus::Sent;
                    touch.sent_at = Some(at);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::{
        Campaign, CampaignStatus, Channel, Enrollment, TouchDefinition, TouchRecord,
    };

    fn setup(delays: &[u32], first_at: DateTime<Utc>) -> (Arc<EngineStore>, Enrollment) {
        let store = Arc::new(EngineStore::new());
        let owner = Uuid::new_v4();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Follow-up".to_string(),
            service_type: None,
            status: CampaignStatus::Active,
            touches: delays
                .iter()
                .enumerate()
                .map(|(i, d)| TouchDefinition {
                    touch_number: i as u32 + 1,
                    channel: Channel::Email,
                    delay_hours: *d,
                    content_ref: "t".to_string(),
                })
                .collect(),
            created_at: first_at,
            updated_at: first_at,
        };
        let mut touches = vec![TouchRecord::unscheduled(); delays.len()];
        touches[0].scheduled_at = Some(first_at);
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            owner_id: owner,
            campaign_id: campaign.id,
            job_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            status: EnrollmentStatus::Active,
            stop_reason: None,
            current_touch: 1,
            touches,
            enrolled_at: first_at,
            completed_at: None,
            stopped_at: None,
            claimed_at: None,
        };
        store.upsert_campaign(campaign);
        store.insert_enrollment(enrollment.clone()).unwrap();
        (store, enrollment)
    }

    #[test]
    fn test_claim_only_due_and_unclaimed() {
        let now = Utc::now();
        let (store, _) = setup(&[0, 24], now + Duration::minutes(10));
        let claimer = TouchClaimer::new(store);

        assert!(claimer.claim_due_touches(now, 10).unwrap().is_empty());
        let later = now + Duration::minutes(10);
        assert_eq!(claimer.claim_due_touches(later, 10).unwrap().len(), 1);
        assert!(claimer.claim_due_touches(later, 10).unwrap().is_empty());
    }

    #[test]
    fn test_advance_anchors_to_scheduled_time() {
        let scheduled = Utc::now() - Duration::hours(3);
        let (store, enrollment) = setup(&[0, 48], scheduled);
        let claimer = TouchClaimer::new(store.clone());
        let now = Utc::now();

        let claim = claimer.claim_due_touches(now, 1).unwrap().remove(0);
        let advance = claimer
            .resolve_touch(&claim, TouchOutcome::Sent { at: now }, now)
            .unwrap();
        assert_eq!(
            advance,
            Advance::Next {
                touch: 2,
                scheduled_at: scheduled + Duration::hours(48)
            }
        );

        let e = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(e.current_touch, 2);
        assert_eq!(e.touches[0].sent_at, Some(now));
        assert!(e.claimed_at.is_none());

        // Resolving the same claim twice does not skip a touch
        assert_eq!(
            claimer.resolve_touch(&claim, TouchOutcome::Failed, now).unwrap(),
            Advance::Stale
        );
    }

    #[test]
    fn test_last_touch_completes() {
        let now = Utc::now();
        let (store, enrollment) = setup(&[0], now);
        let claimer = TouchClaimer::new(store.clone());
        let claim = claimer.claim_due_touches(now, 1).unwrap().remove(0);
        assert_eq!(
            claimer.resolve_touch(&claim, TouchOutcome::Skipped, now).unwrap(),
            Advance::Completed
        );
        let e = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(e.completed_at, Some(now));
        assert_eq!(e.touches[0].status, TouchStatus::Skipped);
        assert!(store.live_enrollment_for(e.owner_id, e.customer_id).is_none());
    }

    #[test]
    fn test_recover_stuck_releases_old_leases() {
        let now = Utc::now();
        let (store, _) = setup(&[0], now);
        let claimer = TouchClaimer::new(store);
        claimer.claim_due_touches(now, 1).unwrap();

        assert_eq!(claimer.recover_stuck(now + Duration::minutes(5), Duration::minutes(10)).unwrap(), 0);
        let later = now + Duration::minutes(11);
        assert_eq!(claimer.recover_stuck(later, Duration::minutes(10)).unwrap(), 1);
        assert_eq!(claimer.claim_due_touches(later, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_defer_reschedules_same_touch() {
        let now = Utc::now();
        let (store, enrollment) = setup(&[0, 1], now);
        let claimer = TouchClaimer::new(store.clone());
        let claim = claimer.claim_due_touches(now, 1).unwrap().remove(0);
        let until = now + Duration::hours(9);
        assert!(claimer.defer(&claim, until).unwrap());

        let e = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(e.current_touch, 1);
        assert_eq!(e.touches[0].scheduled_at, Some(until));
        assert_eq!(e.touches[0].status, TouchStatus::Pending);
        assert!(claimer.claim_due_touches(now, 1).unwrap().is_empty());
        assert_eq!(claimer.claim_due_touches(until, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_resume_mid_flight_keeps_original_anchor() {
        let scheduled = Utc::now() - Duration::hours(1);
        let (store, enrollment) = setup(&[0, 24], scheduled);
        let claimer = TouchClaimer::new(store.clone());
        let lifecycle = crate::lifecycle::LifecycleManager::new(store.clone());
        let now = Utc::now();

        let claim = claimer.claim_due_touches(now, 1).unwrap().remove(0);
        let resumed_at = now + Duration::hours(2);
        lifecycle.pause(enrollment.campaign_id, now).unwrap();
        lifecycle.resume(enrollment.campaign_id, resumed_at).unwrap();
        assert_eq!(
            store.get_enrollment(enrollment.id).unwrap().touches[0].scheduled_at,
            Some(resumed_at)
        );

        let advance = claimer
            .resolve_touch(&claim, TouchOutcome::Sent { at: now }, resumed_at)
            .unwrap();
        assert_eq!(
            advance,
            Advance::Next {
                touch: 2,
                scheduled_at: scheduled + Duration::hours(24)
            }
        );
    }

    #[test]
    fn test_missing_campaign_stops_enrollment() {
        let now = Utc::now();
        let (store, enrollment) = setup(&[0, 24], now);
        let claimer = TouchClaimer::new(store.clone());
        let claim = claimer.claim_due_touches(now, 1).unwrap().remove(0);
        store.remove_campaign(enrollment.campaign_id);

        assert_eq!(
            claimer.resolve_touch(&claim, TouchOutcome::Failed, now).unwrap(),
            Advance::Stopped
        );
        let e = store.get_enrollment(enrollment.id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Stopped);
        assert_eq!(e.stop_reason, Some(StopReason::CampaignDeleted));
        assert!(e.claimed_at.is_none());
        assert!(store.live_enrollment_for(e.owner_id, e.customer_id).is_none());
    }
}
