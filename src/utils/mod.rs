//! Clock and calendar helpers shared by the entitlement rules

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use chrono::{DateTime, Datelike, TimeZone, Utc};

/// Whole days elapsed between `start` and `now` (floored, never negative)
pub fn days_since(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - start).num_days().max(0)
}

/// Calendar-month key in "YYYY-MM" format
pub fn period_key(at: DateTime<Utc>) -> String {
    format!("{}-{:02}", at.year(), at.month())
}

/// Convert provider epoch seconds into a UTC timestamp
pub fn from_epoch_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_days_since_floors_partial_days() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(days_since(start, start + Duration::hours(71)), 2);
        assert_eq!(days_since(start, start + Duration::hours(72)), 3);
        // Clock skew backwards never yields negative days
        assert_eq!(days_since(start, start - Duration::days(2)), 0);
    }

    #[test]
    fn test_period_key_zero_pads_month() {
        let at = Utc.with_ymd_and_hms(2025, 2, 28, 23, 59, 0).unwrap();
        assert_eq!(period_key(at), "2025-02");
        let at = Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap();
        assert_eq!(period_key(at), "2025-11");
    }

    #[test]
    fn test_from_epoch_secs() {
        let at = from_epoch_secs(1_735_689_600).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }
}
