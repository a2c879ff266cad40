//! Delivery gatekeeper — consent, quiet hours and rate limit, in that order.

use std::sync::Arc;

use campaign_core::types::{Channel, Customer, SkipReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::eligibility::check_eligibility;
use crate::quiet_hours::{QuietHoursDecision, QuietHoursWindow};
use crate::rate_limit::{rate_limit_key, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    QuietHours,
    RateLimit,
}

/// What to do with a due send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum GateDecision {
    Send,
    /// Never send this touch; record the reason and move on.
    Skip { reason: SkipReason },
    /// Try again later. `until` is set for quiet hours; a rate-limit deferral
    /// is reconsidered on the next pass.
    Defer {
        reason: DeferReason,
        until: Option<DateTime<Utc>>,
    },
}

/// Everything the gatekeeper needs to judge one send.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    pub channel: Channel,
    pub owner_id: Uuid,
    pub customer: &'a Customer,
    /// Business timezone used when the customer has none.
    pub owner_timezone: Option<&'a str>,
    pub scheduled_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

pub struct DeliveryGatekeeper {
    quiet_hours: QuietHoursWindow,
    limiter: Arc<dyn RateLimiter>,
}

impl DeliveryGatekeeper {
    pub fn new(quiet_hours: QuietHoursWindow, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            quiet_hours,
            limiter,
        }
    }

    pub fn quiet_hours(&self) -> &QuietHoursWindow {
        &self.quiet_hours
    }

    /// Quiet hours only; used by the retry queue before consent is re-checked.
    pub fn check_quiet_hours(
        &self,
        at: DateTime<Utc>,
        customer: &Customer,
        owner_timezone: Option<&str>,
    ) -> QuietHoursDecision {
        let tz = customer.timezone.as_deref().or(owner_timezone);
        self.quiet_hours.check(at, tz)
    }

    pub async fn check_rate_limit(&self, channel: Channel, owner_id: Uuid, now: DateTime<Utc>) -> bool {
        self.limiter.allow(&rate_limit_key(channel, owner_id), now).await
    }

    /// Evaluate a send. The rate limiter is consulted last so that skipped
    /// and deferred touches never consume a slot.
    pub async fn evaluate(&self, req: GateRequest<'_>) -> GateDecision {
        let eligibility = check_eligibility(req.channel, req.customer);
        if let Some(reason) = eligibility.skip_reason {
            debug!(customer_id = %req.customer.id, reason = reason.as_str(), "Touch ineligible");
            return GateDecision::Skip { reason };
        }

        // The send happens now, so a late-processed touch is judged at the real send time.
        let send_at = req.scheduled_at.max(req.now);
        if let QuietHoursDecision::Deferred { until } =
            self.check_quiet_hours(send_at, req.customer, req.owner_timezone)
        {
            return GateDecision::Defer {
                reason: DeferReason::QuietHours,
                until: Some(until),
            };
        }

        if !self.check_rate_limit(req.channel, req.owner_id, req.now).await {
            return GateDecision::Defer {
                reason: DeferReason::RateLimit,
                until: None,
            };
        }

        GateDecision::Send
    }
}
