//! Checks applied before every touch goes out: consent, quiet hours and
//! per-owner send rate.

#![warn(clippy::unwrap_used)]

pub mod eligibility;
pub mod gatekeeper;
pub mod quiet_hours;
pub mod rate_limit;

pub use eligibility::{check_eligibility, Eligibility};
pub use gatekeeper::{DeferReason, DeliveryGatekeeper, GateDecision, GateRequest};
pub use quiet_hours::{QuietHoursDecision, QuietHoursWindow};
pub use rate_limit::{rate_limit_key, RateLimiter, SlidingWindowLimiter};
