use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Outbound channel a touch is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Campaign ───────────────────────────────────────────────────────────────

/// One step of a campaign's outreach sequence.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TouchDefinition {
    /// 1-based position in the sequence.
    pub touch_number: u32,
    pub channel: Channel,
    /// Delay relative to the previous touch's scheduled time (touch 1: relative to enrollment).
    pub delay_hours: u32,
    pub content_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Paused,
}

/// A multi-touch outreach sequence owned by a business.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Campaign {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    /// `None` applies the campaign to every service type.
    pub service_type: Option<String>,
    pub status: CampaignStatus,
    pub touches: Vec<TouchDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn touch(&self, touch_number: u32) -> Option<&TouchDefinition> {
        touch_number
            .checked_sub(1)
            .and_then(|idx| self.touches.get(idx as usize))
    }

    pub fn total_touches(&self) -> u32 {
        self.touches.len() as u32
    }

    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }
}

// ─── Enrollment ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Frozen,
    Completed,
    Stopped,
}

impl EnrollmentStatus {
    /// Active and frozen enrollments still hold the customer's single live slot.
    pub fn is_live(&self) -> bool {
        matches!(self, EnrollmentStatus::Active | EnrollmentStatus::Frozen)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Frozen => "frozen",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ReviewClicked,
    FeedbackSubmitted,
    OptedOutSms,
    OptedOutEmail,
    OwnerStopped,
    CampaignPaused,
    CampaignDeleted,
    RepeatJob,
}

impl StopReason {
    /// The customer already did what the sequence was asking for.
    pub fn is_success(&self) -> bool {
        matches!(self, StopReason::ReviewClicked | StopReason::FeedbackSubmitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchStatus {
    Pending,
    Sent,
    Skipped,
    Failed,
}

/// Per-touch progress, one per campaign touch definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchRecord {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: TouchStatus,
}

impl TouchRecord {
    pub fn unscheduled() -> Self {
        Self {
            scheduled_at: None,
            sent_at: None,
            status: TouchStatus::Pending,
        }
    }
}

/// A customer's run through one campaign's touch sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub campaign_id: Uuid,
    pub job_id: Uuid,
    pub customer_id: Uuid,
    pub status: EnrollmentStatus,
    pub stop_reason: Option<StopReason>,
    /// 1-based index of the lowest unresolved touch.
    pub current_touch: u32,
    /// Fixed length, one entry per campaign touch; index 0 is touch 1.
    pub touches: Vec<TouchRecord>,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Claim lease; `None` when no worker owns the current touch.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn total_touches(&self) -> u32 {
        self.touches.len() as u32
    }

    pub fn touch(&self, touch_number: u32) -> Option<&TouchRecord> {
        touch_number
            .checked_sub(1)
            .and_then(|idx| self.touches.get(idx as usize))
    }

    pub fn touch_mut(&mut self, touch_number: u32) -> Option<&mut TouchRecord> {
        touch_number
            .checked_sub(1)
            .and_then(move |idx| self.touches.get_mut(idx as usize))
    }

    pub fn current(&self) -> Option<&TouchRecord> {
        self.touch(self.current_touch)
    }

    pub fn current_mut(&mut self) -> Option<&mut TouchRecord> {
        self.touch_mut(self.current_touch)
    }

    /// When the enrollment left the live states, if it has.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            EnrollmentStatus::Completed => self.completed_at,
            EnrollmentStatus::Stopped => self.stopped_at,
            _ => None,
        }
    }

    /// The current touch is pending, scheduled, and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self
                .current()
                .map(|t| {
                    t.status == TouchStatus::Pending
                        && t.scheduled_at.map(|at| at <= now).unwrap_or(false)
                })
                .unwrap_or(false)
    }
}

// ─── Job ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentResolution {
    Conflict,
    QueueAfter,
    Skipped,
    Suppressed,
    ReplaceOnComplete,
}

/// A completed service job; the trigger for enrollment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub customer_id: Uuid,
    pub service_type: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub enrollment_resolution: Option<EnrollmentResolution>,
    pub conflict_detected_at: Option<DateTime<Utc>>,
    /// Enrollment created from this job, once one exists.
    pub enrollment_id: Option<Uuid>,
}

// ─── Owner / customer ───────────────────────────────────────────────────────

/// The business that owns campaigns, customers and jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    pub timezone: Option<String>,
    /// Hours from enrollment to the first touch, keyed by service type.
    #[serde(default)]
    pub service_type_timing: HashMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SmsConsent {
    OptedIn,
    OptedOut,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Customer {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Email opt-out.
    #[serde(default)]
    pub opted_out: bool,
    #[serde(default)]
    pub sms_consent: SmsConsent,
    pub timezone: Option<String>,
}

// ─── Sends / retries ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
}

/// One delivery attempt target for a single touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub customer_id: Uuid,
    pub enrollment_id: Uuid,
    pub campaign_id: Uuid,
    pub touch_number: u32,
    pub channel: Channel,
    pub status: SendStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Stable key shared by every attempt at the same touch.
pub fn idempotency_key(enrollment_id: Uuid, touch_number: u32) -> String {
    format!("{enrollment_id}:touch:{touch_number}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    QuietHours,
    ChannelError,
    RateLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub id: Uuid,
    pub send_id: Uuid,
    pub customer_id: Uuid,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub scheduled_for: DateTime<Utc>,
    pub status: RetryStatus,
    pub reason: RetryReason,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Why the gatekeeper declined to send a touch at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OptedOutEmail,
    NoEmail,
    NoSmsConsent,
    NoPhone,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::OptedOutEmail => "opted_out_email",
            SkipReason::NoEmail => "no_email",
            SkipReason::NoSmsConsent => "no_sms_consent",
            SkipReason::NoPhone => "no_phone",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn enrollment(touches: Vec<TouchRecord>) -> Enrollment {
        let now = Utc::now();
        Enrollment {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            status: EnrollmentStatus::Active,
            stop_reason: None,
            current_touch: 1,
            touches,
            enrolled_at: now,
            completed_at: None,
            stopped_at: None,
            claimed_at: None,
        }
    }

    #[test]
    fn test_touch_indexing_is_one_based() {
        let mut e = enrollment(vec![TouchRecord::unscheduled(), TouchRecord::unscheduled()]);
        assert!(e.touch(0).is_none());
        assert!(e.touch(2).is_some());
        assert!(e.touch(3).is_none());
        e.touch_mut(2).unwrap().status = TouchStatus::Sent;
        assert_eq!(e.touches[1].status, TouchStatus::Sent);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut e = enrollment(vec![TouchRecord {
            scheduled_at: Some(now + Duration::minutes(5)),
            sent_at: None,
            status: TouchStatus::Pending,
        }]);
        assert!(!e.is_due(now));
        assert!(e.is_due(now + Duration::minutes(5)));
        e.status = EnrollmentStatus::Frozen;
        assert!(!e.is_due(now + Duration::hours(1)));
    }

    #[test]
    fn test_stop_reason_success() {
        assert!(StopReason::ReviewClicked.is_success());
        assert!(StopReason::FeedbackSubmitted.is_success());
        assert!(!StopReason::OwnerStopped.is_success());
        assert!(!StopReason::RepeatJob.is_success());
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(idempotency_key(id, 2), idempotency_key(id, 2));
        assert_ne!(idempotency_key(id, 2), idempotency_key(id, 3));
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&EnrollmentResolution::QueueAfter).unwrap();
        assert_eq!(json, "\"queue_after\"");
        let reason: StopReason = serde_json::from_str("\"opted_out_sms\"").unwrap();
        assert_eq!(reason, StopReason::OptedOutSms);
    }
}
