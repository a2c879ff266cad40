//! In-memory engine store backed by DashMap.
//!
//! Every mutation goes through a per-record entry lock, which gives the
//! same guarantees the engine needs from a transactional database: single
//! record read-modify-write, a uniqueness constraint on the customer's live
//! enrollment, and compare-and-swap claims.
//!
//! Lock discipline: a closure passed to an `update_*` method must not touch
//! the store; the live-enrollment index is only modified after the
//! enrollment's entry guard has been released.

use campaign_core::types::{
    Business, Campaign, Customer, Enrollment, EnrollmentResolution, Job, RetryQueueItem,
    RetryStatus, SendRecord,
};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::alerts::Alert;

pub struct EngineStore {
    businesses: DashMap<Uuid, Business>,
    campaigns: DashMap<Uuid, Campaign>,
    customers: DashMap<Uuid, Customer>,
    jobs: DashMap<Uuid, Job>,
    enrollments: DashMap<Uuid, Enrollment>,
    /// (owner, customer) -> the customer's single active-or-frozen enrollment.
    live: DashMap<(Uuid, Uuid), Uuid>,
    sends: DashMap<Uuid, SendRecord>,
    send_keys: DashMap<String, Uuid>,
    retries: DashMap<Uuid, RetryQueueItem>,
    alerts: DashMap<Uuid, Alert>,
}

impl EngineStore {
    pub fn new() -> Self {
        info!("Engine store initialized (in-memory)");
        Self {
            businesses: DashMap::new(),
            campaigns: DashMap::new(),
            customers: DashMap::new(),
            jobs: DashMap::new(),
            enrollments: DashMap::new(),
            live: DashMap::new(),
            sends: DashMap::new(),
            send_keys: DashMap::new(),
            retries: DashMap::new(),
            alerts: DashMap::new(),
        }
    }

    // ─── Businesses ────────────────────────────────────────────────────────

    pub fn upsert_business(&self, business: Business) {
        self.businesses.insert(business.id, business);
    }

    pub fn get_business(&self, id: Uuid) -> Option<Business> {
        self.businesses.get(&id).map(|r| r.value().clone())
    }

    // ─── Campaigns ─────────────────────────────────────────────────────────

    pub fn upsert_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn get_campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.get(&id).map(|r| r.value().clone())
    }

    pub fn update_campaign<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Campaign) -> CampaignResult<R>,
    ) -> CampaignResult<R> {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("Campaign", id))?;
        f(entry.value_mut())
    }

    pub fn remove_campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.remove(&id).map(|(_, c)| c)
    }

    pub fn campaigns_for_owner(&self, owner_id: Uuid) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|r| r.value().owner_id == owner_id)
            .map(|r| r.value().clone())
            .collect();
        campaigns.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        campaigns
    }

    // ─── Customers ─────────────────────────────────────────────────────────

    pub fn upsert_customer(&self, customer: Customer) {
        self.customers.insert(customer.id, customer);
    }

    pub fn get_customer(&self, id: Uuid) -> Option<Customer> {
        self.customers.get(&id).map(|r| r.value().clone())
    }

    pub fn update_customer<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Customer) -> R,
    ) -> CampaignResult<R> {
        let mut entry = self
            .customers
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("Customer", id))?;
        Ok(f(entry.value_mut()))
    }

    // ─── Jobs ──────────────────────────────────────────────────────────────

    pub fn upsert_job(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|r| r.value().clone())
    }

    pub fn update_job<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Job) -> CampaignResult<R>,
    ) -> CampaignResult<R> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("Job", id))?;
        f(entry.value_mut())
    }

    pub fn jobs_with_resolution(&self, resolution: EnrollmentResolution) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|r| r.value().enrollment_resolution == Some(resolution))
            .map(|r| r.value().clone())
            .collect();
        jobs.sort_by_key(|j| j.completed_at);
        jobs
    }

    // ─── Enrollments ───────────────────────────────────────────────────────

    /// Insert a new live enrollment. Fails with `Conflict` if the customer
    /// already holds one under the same owner.
    pub fn insert_enrollment(&self, enrollment: Enrollment) -> CampaignResult<()> {
        if !enrollment.status.is_live() {
            self.enrollments.insert(enrollment.id, enrollment);
            return Ok(());
        }
        match self.live.entry((enrollment.owner_id, enrollment.customer_id)) {
            Entry::Occupied(existing) => Err(CampaignError::Conflict(format!(
                "customer {} already has live enrollment {}",
                enrollment.customer_id,
                existing.get()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(enrollment.id);
                self.enrollments.insert(enrollment.id, enrollment);
                Ok(())
            }
        }
    }

    pub fn get_enrollment(&self, id: Uuid) -> Option<Enrollment> {
        self.enrollments.get(&id).map(|r| r.value().clone())
    }

    /// Read-modify-write one enrollment. Leaving the live states releases
    /// the customer's live slot.
    pub fn update_enrollment<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Enrollment) -> CampaignResult<R>,
    ) -> CampaignResult<R> {
        let (result, released) = {
            let mut entry = self
                .enrollments
                .get_mut(&id)
                .ok_or_else(|| CampaignError::not_found("Enrollment", id))?;
            let was_live = entry.status.is_live();
            let result = f(entry.value_mut())?;
            let released = (was_live && entry.status.is_terminal())
                .then(|| (entry.owner_id, entry.customer_id));
            (result, released)
        };
        if let Some(key) = released {
            self.live.remove_if(&key, |_, live_id| *live_id == id);
        }
        Ok(result)
    }

    pub fn live_enrollment_for(&self, owner_id: Uuid, customer_id: Uuid) -> Option<Enrollment> {
        let id = self.live.get(&(owner_id, customer_id)).map(|r| *r.value())?;
        self.get_enrollment(id)
    }

    /// The customer's most recently ended (completed or stopped) enrollment.
    pub fn latest_ended_enrollment(&self, owner_id: Uuid, customer_id: Uuid) -> Option<Enrollment> {
        self.enrollments
            .iter()
            .filter(|r| {
                let e = r.value();
                e.owner_id == owner_id && e.customer_id == customer_id && e.ended_at().is_some()
            })
            .max_by_key(|r| r.value().ended_at())
            .map(|r| r.value().clone())
    }

    pub fn enrollments_for_campaign(&self, campaign_id: Uuid) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|r| r.value().campaign_id == campaign_id)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn enrollments_for_customer(&self, owner_id: Uuid, customer_id: Uuid) -> Vec<Enrollment> {
        let mut list: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().owner_id == owner_id && r.value().customer_id == customer_id)
            .map(|r| r.value().clone())
            .collect();
        list.sort_by_key(|e| e.enrolled_at);
        list
    }

    pub fn all_enrollments(&self) -> Vec<Enrollment> {
        self.enrollments.iter().map(|r| r.value().clone()).collect()
    }

    /// Due, unclaimed enrollments ordered by the current touch's scheduled time.
    pub fn due_enrollments(&self, now: DateTime<Utc>) -> Vec<(Uuid, DateTime<Utc>)> {
        let mut due: Vec<(Uuid, DateTime<Utc>)> = self
            .enrollments
            .iter()
            .filter(|r| r.value().claimed_at.is_none() && r.value().is_due(now))
            .filter_map(|r| {
                let scheduled = r.value().current().and_then(|t| t.scheduled_at)?;
                Some((*r.key(), scheduled))
            })
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due
    }

    pub fn enrollments_claimed_before(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.enrollments
            .iter()
            .filter(|r| r.value().claimed_at.map(|at| at < cutoff).unwrap_or(false))
            .map(|r| *r.key())
            .collect()
    }

    // ─── Send records ──────────────────────────────────────────────────────

    /// Return the send record for the record's idempotency key, inserting
    /// `record` if none exists. The flag is `true` when inserted.
    pub fn get_or_create_send(&self, record: SendRecord) -> (SendRecord, bool) {
        match self.send_keys.entry(record.idempotency_key.clone()) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                drop(existing);
                match self.get_send(id) {
                    Some(found) => (found, false),
                    None => {
                        self.sends.insert(id, SendRecord { id, ..record.clone() });
                        (SendRecord { id, ..record }, true)
                    }
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record.id);
                self.sends.insert(record.id, record.clone());
                (record, true)
            }
        }
    }

    pub fn get_send(&self, id: Uuid) -> Option<SendRecord> {
        self.sends.get(&id).map(|r| r.value().clone())
    }

    pub fn update_send<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut SendRecord) -> R,
    ) -> CampaignResult<R> {
        let mut entry = self
            .sends
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("Send", id))?;
        Ok(f(entry.value_mut()))
    }

    pub fn sends_for_enrollment(&self, enrollment_id: Uuid) -> Vec<SendRecord> {
        let mut list: Vec<SendRecord> = self
            .sends
            .iter()
            .filter(|r| r.value().enrollment_id == enrollment_id)
            .map(|r| r.value().clone())
            .collect();
        list.sort_by_key(|s| s.touch_number);
        list
    }

    // ─── Retry queue ───────────────────────────────────────────────────────

    pub fn insert_retry(&self, item: RetryQueueItem) {
        self.retries.insert(item.id, item);
    }

    pub fn get_retry(&self, id: Uuid) -> Option<RetryQueueItem> {
        self.retries.get(&id).map(|r| r.value().clone())
    }

    pub fn update_retry<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut RetryQueueItem) -> CampaignResult<R>,
    ) -> CampaignResult<R> {
        let mut entry = self
            .retries
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("RetryQueueItem", id))?;
        f(entry.value_mut())
    }

    pub fn due_retries(&self, now: DateTime<Utc>) -> Vec<(Uuid, DateTime<Utc>)> {
        let mut due: Vec<(Uuid, DateTime<Utc>)> = self
            .retries
            .iter()
            .filter(|r| r.value().status == RetryStatus::Pending && r.value().scheduled_for <= now)
            .map(|r| (*r.key(), r.value().scheduled_for))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due
    }

    pub fn retries_processing_before(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.retries
            .iter()
            .filter(|r| {
                r.value().status == RetryStatus::Processing
                    && r.value().claimed_at.map(|at| at < cutoff).unwrap_or(true)
            })
            .map(|r| *r.key())
            .collect()
    }

    pub fn retries_for_send(&self, send_id: Uuid) -> Vec<RetryQueueItem> {
        let mut list: Vec<RetryQueueItem> = self
            .retries
            .iter()
            .filter(|r| r.value().send_id == send_id)
            .map(|r| r.value().clone())
            .collect();
        list.sort_by_key(|i| (i.attempt_count, i.created_at));
        list
    }

    pub fn pending_retries_for_customer(&self, customer_id: Uuid) -> Vec<Uuid> {
        self.retries
            .iter()
            .filter(|r| r.value().customer_id == customer_id && r.value().status == RetryStatus::Pending)
            .map(|r| *r.key())
            .collect()
    }

    // ─── Alerts ────────────────────────────────────────────────────────────

    pub fn insert_alert(&self, alert: Alert) {
        self.alerts.insert(alert.id, alert);
    }

    pub fn get_alert(&self, id: Uuid) -> Option<Alert> {
        self.alerts.get(&id).map(|r| r.value().clone())
    }

    pub fn update_alert<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Alert) -> CampaignResult<R>,
    ) -> CampaignResult<R> {
        let mut entry = self
            .alerts
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("Alert", id))?;
        f(entry.value_mut())
    }

    pub fn alerts_for_owner(&self, owner_id: Uuid) -> Vec<Alert> {
        let mut list: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|r| r.value().owner_id == owner_id)
            .map(|r| r.value().clone())
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }
}

impl Default for EngineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::{Channel, EnrollmentStatus, SendStatus, TouchRecord};

    fn enrollment(owner: Uuid, customer: Uuid) -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            owner_id: owner,
            campaign_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            customer_id: customer,
            status: EnrollmentStatus::Active,
            stop_reason: None,
            current_touch: 1,
            touches: vec![TouchRecord::unscheduled()],
            enrolled_at: Utc::now(),
            completed_at: None,
            stopped_at: None,
            claimed_at: None,
        }
    }

    #[test]
    fn test_one_live_enrollment_per_customer() {
        let store = EngineStore::new();
        let (owner, customer) = (Uuid::new_v4(), Uuid::new_v4());
        let first = enrollment(owner, customer);
        let first_id = first.id;
        store.insert_enrollment(first).unwrap();

        let err = store.insert_enrollment(enrollment(owner, customer)).unwrap_err();
        assert!(matches!(err, CampaignError::Conflict(_)));

        // Same customer id under another owner is a different customer slot
        store.insert_enrollment(enrollment(Uuid::new_v4(), customer)).unwrap();

        // Ending the first frees the slot
        store
            .update_enrollment(first_id, |e| {
                e.status = EnrollmentStatus::Completed;
                e.completed_at = Some(Utc::now());
                Ok(())
            })
            .unwrap();
        assert!(store.live_enrollment_for(owner, customer).is_none());
        store.insert_enrollment(enrollment(owner, customer)).unwrap();
    }

    #[test]
    fn test_concurrent_inserts_admit_exactly_one() {
        let store = EngineStore::new();
        let (owner, customer) = (Uuid::new_v4(), Uuid::new_v4());
        let admitted = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    if store.insert_enrollment(enrollment(owner, customer)).is_ok() {
                        admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(admitted.into_inner(), 1);
    }

    #[test]
    fn test_latest_ended_enrollment() {
        let store = EngineStore::new();
        let (owner, customer) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        for days_ago in [10, 3] {
            let mut e = enrollment(owner, customer);
            e.status = EnrollmentStatus::Stopped;
            e.stopped_at = Some(now - chrono::Duration::days(days_ago));
            store.insert_enrollment(e).unwrap();
        }
        let latest = store.latest_ended_enrollment(owner, customer).unwrap();
        assert_eq!(latest.stopped_at, Some(now - chrono::Duration::days(3)));
    }

    #[test]
    fn test_send_records_are_unique_per_key() {
        let store = EngineStore::new();
        let record = SendRecord {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            enrollment_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            touch_number: 1,
            channel: Channel::Email,
            status: SendStatus::Pending,
            provider_message_id: None,
            error: None,
            idempotency_key: "e:touch:1".to_string(),
            created_at: Utc::now(),
            sent_at: None,
        };
        let (first, created) = store.get_or_create_send(record.clone());
        assert!(created);
        let (second, created_again) = store.get_or_create_send(SendRecord {
            id: Uuid::new_v4(),
            ..record
        });
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }
}
