//! Millisecond-epoch timestamps.
//!
//! Every persisted record carries a millisecond epoch timestamp. The
//! scheduler converts to calendar time (via `chrono`) only at the cron
//! boundary.

use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Convert a millisecond timestamp to a UTC datetime.
///
/// Saturates at the chrono range limits rather than panicking; out-of-range
/// values only arise from corrupted on-disk data.
#[must_use]
pub fn to_datetime(ms: TimestampMs) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        _ => DateTime::<Utc>::MIN_UTC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_recent() {
        // Anything after 2024-01-01 counts as "the clock works".
        assert!(now_ms() > 1_704_067_200_000);
    }

    #[test]
    fn test_round_trip() {
        let ms = 1_735_689_600_000; // 2025-01-01T00:00:00Z
        let dt = to_datetime(ms);
        assert_eq!(dt.timestamp_millis(), ms);
    }

    #[test]
    fn test_out_of_range_saturates() {
        assert_eq!(to_datetime(i64::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
