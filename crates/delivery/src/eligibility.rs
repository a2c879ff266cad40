//! Consent and reachability checks applied before every send.

use campaign_core::types::{Channel, Customer, SkipReason, SmsConsent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub skip_reason: Option<SkipReason>,
}

impl Eligibility {
    fn ok() -> Self {
        Self {
            eligible: true,
            skip_reason: None,
        }
    }

    fn skip(reason: SkipReason) -> Self {
        Self {
            eligible: false,
            skip_reason: Some(reason),
        }
    }
}

fn has_value(field: &Option<String>) -> bool {
    field.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Email needs an address and no opt-out; SMS needs explicit opt-in and a phone.
pub fn check_eligibility(channel: Channel, customer: &Customer) -> Eligibility {
    match channel {
        Channel::Email => {
            if customer.opted_out {
                Eligibility::skip(SkipReason::OptedOutEmail)
            } else if !has_value(&customer.email) {
                Eligibility::skip(SkipReason::NoEmail)
            } else {
                Eligibility::ok()
            }
        }
        Channel::Sms => {
            if customer.sms_consent != SmsConsent::OptedIn {
                Eligibility::skip(SkipReason::NoSmsConsent)
            } else if !has_value(&customer.phone) {
                Eligibility::skip(SkipReason::NoPhone)
            } else {
                Eligibility::ok()
            }
        }
    }
}
