//! Provider error classification.
//!
//! Recipient-level errors can never succeed on retry; everything else is
//! treated as transient.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Permanent,
    Retryable,
}

/// Engine-level codes plus the Twilio codes for the same recipient failures
/// (21211 invalid number, 21610 unsubscribed, 21614 not a mobile number).
pub const PERMANENT_ERROR_CODES: &[&str] = &[
    "invalid_format",
    "invalid_recipient",
    "unsubscribed",
    "not_mobile",
    "landline",
    "channel_not_configured",
    "21211",
    "21610",
    "21614",
];

/// Error codes produced by the dispatcher itself.
pub const TIMEOUT_ERROR_CODE: &str = "timeout";
pub const NOT_CONFIGURED_ERROR_CODE: &str = "channel_not_configured";

pub fn classify(error_code: Option<&str>) -> FailureKind {
    match error_code {
        Some(code)
            if PERMANENT_ERROR_CODES
                .iter()
                .any(|c| c.eq_ignore_ascii_case(code.trim())) =>
        {
            FailureKind::Permanent
        }
        _ => FailureKind::Retryable,
    }
}
