//! Cron next-match computation in the intent's time zone.
//!
//! Expressions are standard 5-field (minute hour day-of-month month
//! day-of-week) with an optional trailing year field. The next match is
//! computed in the target zone's calendar and converted back to an
//! absolute instant, so DST gaps are skipped to the next real local time
//! rather than fired twice.

use std::str::FromStr;

use chrono::TimeZone;
use chrono_tz::Tz;
use cron::Schedule;

use spindle_core::TimestampMs;

use crate::error::{ScheduleError, ScheduleResult};

/// Parse and validate a 5-field (plus optional year) cron expression.
///
/// # Errors
///
/// Returns [`ScheduleError::InvalidCron`] when the expression does not
/// parse.
pub(crate) fn parse_cron(expr: &str) -> ScheduleResult<Schedule> {
    let fields = expr.split_whitespace().count();
    if !(5..=6).contains(&fields) {
        return Err(ScheduleError::InvalidCron(format!(
            "expected 5 fields (plus optional year), got {fields}"
        )));
    }
    // The parser wants a seconds field; pin it to zero.
    let with_seconds = format!("0 {expr}");
    Schedule::from_str(&with_seconds)
        .map_err(|err| ScheduleError::InvalidCron(err.to_string()))
}

/// Resolve an IANA time zone name; `None` means UTC.
///
/// # Errors
///
/// Returns [`ScheduleError::InvalidTimeZone`] for unknown names.
pub(crate) fn parse_time_zone(name: Option<&str>) -> ScheduleResult<Tz> {
    match name {
        None => Ok(chrono_tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimeZone(name.to_owned())),
    }
}

/// The next fire instant strictly after `after_ms`, in the given zone.
///
/// Returns `None` when the expression has no future match (e.g. a
/// year-bounded expression in the past).
///
/// # Errors
///
/// Returns an error for a malformed expression or unknown time zone.
pub fn next_cron_match(
    expr: &str,
    time_zone: Option<&str>,
    after_ms: TimestampMs,
) -> ScheduleResult<Option<TimestampMs>> {
    let schedule = parse_cron(expr)?;
    let tz = parse_time_zone(time_zone)?;

    let after = match tz.timestamp_millis_opt(after_ms) {
        chrono::LocalResult::Single(dt) => dt,
        // Epoch millis always map to exactly one zoned instant.
        _ => return Ok(None),
    };

    Ok(schedule
        .after(&after)
        .next()
        .map(|dt| dt.timestamp_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ms(rfc3339: &str) -> TimestampMs {
        chrono::DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis()
    }

    #[test]
    fn test_hourly_next_match() {
        // From 09:30 UTC the next top of hour is 10:00.
        let next = next_cron_match("0 * * * *", Some("UTC"), ms("2026-03-02T09:30:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(next, ms("2026-03-02T10:00:00Z"));
    }

    #[test]
    fn test_next_match_is_strictly_after() {
        // Exactly on a match: the next one is an hour later.
        let next = next_cron_match("0 * * * *", Some("UTC"), ms("2026-03-02T10:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(next, ms("2026-03-02T11:00:00Z"));
    }

    #[test]
    fn test_dst_gap_skips_to_real_local_time() {
        // US DST spring-forward 2026-03-08: 02:30 America/New_York does
        // not exist that night. The match must skip to the next real
        // 02:30 local, not fire twice or land inside the gap.
        let next = next_cron_match(
            "30 2 * * *",
            Some("America/New_York"),
            ms("2026-03-08T05:00:00Z"), // 00:00 local, before the gap
        )
        .unwrap()
        .unwrap();
        let as_utc = spindle_core::time::to_datetime(next);
        // 02:30 EDT on the 9th == 06:30 UTC.
        assert_eq!(as_utc, chrono::DateTime::parse_from_rfc3339("2026-03-09T06:30:00Z").unwrap());
    }

    #[test]
    fn test_yearly_expression() {
        let next = next_cron_match("0 12 1 1 *", Some("UTC"), ms("2026-06-01T00:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(next, ms("2027-01-01T12:00:00Z"));
    }

    #[test]
    fn test_optional_year_field() {
        let next = next_cron_match("0 12 1 1 * 2028", Some("UTC"), ms("2026-06-01T00:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(next, ms("2028-01-01T12:00:00Z"));

        // A year already in the past has no future match.
        let none = next_cron_match("0 12 1 1 * 2020", Some("UTC"), ms("2026-06-01T00:00:00Z"))
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_invalid_expression_rejected() {
        use spindle_core::ErrorCode;
        let err = next_cron_match("not a cron", None, 0).unwrap_err();
        assert_eq!(err.code(), "invalid_cron");
        let err = next_cron_match("* * * *", None, 0).unwrap_err();
        assert_eq!(err.code(), "invalid_cron");
    }

    #[test]
    fn test_invalid_time_zone_rejected() {
        use spindle_core::ErrorCode;
        let err = next_cron_match("0 * * * *", Some("Mars/Olympus"), 0).unwrap_err();
        assert_eq!(err.code(), "invalid_time_zone");
    }

    #[test]
    fn test_local_zone_computation() {
        // 23:45 in Tokyo: next hourly match is 00:00 Tokyo == 15:00 UTC.
        let next = next_cron_match(
            "0 * * * *",
            Some("Asia/Tokyo"),
            ms("2026-03-02T14:45:00Z"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(next, ms("2026-03-02T15:00:00Z"));
    }
}
