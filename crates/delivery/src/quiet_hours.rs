//! Quiet hours — keeps sends inside the customer's local daytime window.

use campaign_core::config::QuietHoursConfig;
use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Outcome of a quiet-hours check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum QuietHoursDecision {
    Open,
    /// Outside the window; hold the send until `until`.
    Deferred { until: DateTime<Utc> },
}

/// Local sending window `[start_hour, end_hour)`.
#[derive(Debug, Clone)]
pub struct QuietHoursWindow {
    start_hour: u32,
    end_hour: u32,
    default_tz: Tz,
}

impl QuietHoursWindow {
    pub fn new(start_hour: u32, end_hour: u32, default_tz: Tz) -> Self {
        Self {
            start_hour: start_hour.min(23),
            end_hour: end_hour.clamp(1, 24),
            default_tz,
        }
    }

    pub fn from_config(config: &QuietHoursConfig) -> Self {
        let default_tz = config.default_timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                timezone = %config.default_timezone,
                "Unknown default timezone, using America/New_York"
            );
            chrono_tz::America::New_York
        });
        Self::new(config.start_hour, config.end_hour, default_tz)
    }

    /// Parses an IANA name, falling back to the default zone when missing or unknown.
    pub fn resolve_timezone(&self, timezone: Option<&str>) -> Tz {
        match timezone {
            Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
                warn!(timezone = %name, fallback = %self.default_tz, "Unknown timezone");
                self.default_tz
            }),
            None => self.default_tz,
        }
    }

    pub fn is_open(&self, at: DateTime<Utc>, timezone: Option<&str>) -> bool {
        let tz = self.resolve_timezone(timezone);
        let hour = at.with_timezone(&tz).hour();
        hour >= self.start_hour && hour < self.end_hour
    }

    pub fn check(&self, at: DateTime<Utc>, timezone: Option<&str>) -> QuietHoursDecision {
        if self.is_open(at, timezone) {
            QuietHoursDecision::Open
        } else {
            QuietHoursDecision::Deferred {
                until: self.next_open(at, timezone),
            }
        }
    }

    /// The next window opening at or after `at`: today's opening if `at` is
    /// before it, otherwise tomorrow's.
    pub fn next_open(&self, at: DateTime<Utc>, timezone: Option<&str>) -> DateTime<Utc> {
        let tz = self.resolve_timezone(timezone);
        let local = at.with_timezone(&tz);
        let date = if local.hour() < self.start_hour {
            local.date_naive()
        } else {
            local
                .date_naive()
                .checked_add_days(Days::new(1))
                .unwrap_or_else(|| local.date_naive())
        };
        self.opening_on(tz, date)
    }

    fn opening_on(&self, tz: Tz, date: NaiveDate) -> DateTime<Utc> {
        let open = NaiveTime::from_hms_opt(self.start_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        let mut naive = date.and_time(open);
        // A DST gap can swallow the opening hour; slide forward to the first real instant.
        for _ in 0..4 {
            if let Some(instant) = tz.from_local_datetime(&naive).earliest() {
                return instant.with_timezone(&Utc);
            }
            naive += Duration::hours(1);
        }
        Utc.from_utc_datetime(&naive)
    }
}
