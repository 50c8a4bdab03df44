pub mod error;
pub mod traffic;

pub use error::{CommonError, Result};
pub use traffic::{
    DirectionalBytes, StatRecord, TrafficCalculationMethod, WireStat, calculate, parse_stats,
    split,
};

use chrono::{NaiveDateTime, Timelike, Utc};

pub fn current_timestamp() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Truncates a timestamp to the start of its hour, the partition key of every ledger row.
pub fn hour_bucket(at: NaiveDateTime) -> NaiveDateTime {
    at.date().and_hms_opt(at.hour(), 0, 0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_hour_bucket_truncates_minutes_and_seconds() {
        let at = NaiveDate::from_ymd_opt(2025, 8, 10)
            .unwrap()
            .and_hms_milli_opt(13, 47, 12, 512)
            .unwrap();
        let bucket = hour_bucket(at);
        assert_eq!(
            bucket,
            NaiveDate::from_ymd_opt(2025, 8, 10)
                .unwrap()
                .and_hms_opt(13, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn test_hour_bucket_is_idempotent() {
        let at = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(hour_bucket(at), at);
        assert_eq!(hour_bucket(hour_bucket(at)), at);
    }
}
