//! Time-zone-aware calendar queries
//!
//! The scheduler stores instants as unix seconds and computes "what local
//! hour/day is it for this campaign" through these helpers. All of them take
//! the instant explicitly so callers (and tests) control the clock.

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Parse a time-zone string into a `chrono_tz::Tz`, falling back to UTC.
///
/// Campaign and account rows carry free-form zone ids; a bad id degrades to
/// UTC rather than wedging the scheduler.
pub fn parse_tz(tz: &str) -> Tz {
    tz.parse::<Tz>().unwrap_or(chrono_tz::UTC)
}

fn local(now_ts: i64, tz: Tz) -> DateTime<Tz> {
    let utc = DateTime::<Utc>::from_timestamp(now_ts, 0).unwrap_or_else(Utc::now);
    utc.with_timezone(&tz)
}

/// The local hour (0..=23) at `now_ts` in `tz`.
pub fn local_hour(now_ts: i64, tz: Tz) -> u32 {
    local(now_ts, tz).hour()
}

/// The local calendar date at `now_ts` in `tz`.
pub fn local_date(now_ts: i64, tz: Tz) -> NaiveDate {
    local(now_ts, tz).date_naive()
}

/// Seconds elapsed since the local midnight preceding `now_ts`.
pub fn seconds_into_local_day(now_ts: i64, tz: Tz) -> i64 {
    let dt = local(now_ts, tz);
    i64::from(dt.hour()) * 3600 + i64::from(dt.minute()) * 60 + i64::from(dt.second())
}

/// Unix timestamp of the start of the given local calendar day.
///
/// On DST transitions where midnight does not exist locally, the earliest
/// valid instant of the day is used.
pub fn date_start(date: NaiveDate, tz: Tz) -> i64 {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight).timestamp())
}

/// Unix timestamp of the local midnight preceding `now_ts`.
pub fn local_midnight(now_ts: i64, tz: Tz) -> i64 {
    date_start(local_date(now_ts, tz), tz)
}

/// Half-open unix range `[start, end)` covering the local day of `now_ts`.
pub fn local_day_range(now_ts: i64, tz: Tz) -> (i64, i64) {
    let date = local_date(now_ts, tz);
    let next = date.succ_opt().unwrap_or(date);
    (date_start(date, tz), date_start(next, tz))
}

/// Unix timestamp of the local midnight `days` days after the one preceding
/// `now_ts`.
pub fn local_midnight_plus_days(now_ts: i64, tz: Tz, days: i64) -> i64 {
    let date = local_date(now_ts, tz);
    let shifted = date
        .checked_add_days(chrono::Days::new(days.max(0) as u64))
        .unwrap_or(date);
    date_start(shifted, tz)
}

/// Whether `now_ts` falls within the local window `[start_hour, end_hour)`.
///
/// `end_hour <= start_hour` denotes an empty window; cross-midnight windows
/// are not supported.
pub fn within_active_hours(now_ts: i64, tz: Tz, start_hour: u32, end_hour: u32) -> bool {
    if end_hour <= start_hour {
        return false;
    }
    let hour = local_hour(now_ts, tz);
    hour >= start_hour && hour < end_hour
}

/// Number of whole local days between two instants, by calendar date.
pub fn local_days_between(earlier_ts: i64, later_ts: i64, tz: Tz) -> i64 {
    let a = local_date(earlier_ts, tz);
    let b = local_date(later_ts, tz);
    (b - a).num_days()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-04 12:30:00 UTC
    const NOON_ISH: i64 = 1709555400;

    #[test]
    fn test_parse_tz_fallback() {
        assert_eq!(parse_tz("Etc/UTC"), chrono_tz::Etc::UTC);
        assert_eq!(parse_tz("America/New_York"), chrono_tz::America::New_York);
        assert_eq!(parse_tz("not/a-zone"), chrono_tz::UTC);
        assert_eq!(parse_tz(""), chrono_tz::UTC);
    }

    #[test]
    fn test_local_hour_across_zones() {
        assert_eq!(local_hour(NOON_ISH, parse_tz("Etc/UTC")), 12);
        // New York is UTC-5 on that date.
        assert_eq!(local_hour(NOON_ISH, parse_tz("America/New_York")), 7);
    }

    #[test]
    fn test_local_midnight_and_day_range() {
        let tz = parse_tz("Etc/UTC");
        let midnight = local_midnight(NOON_ISH, tz);
        assert_eq!(midnight, NOON_ISH - 12 * 3600 - 30 * 60);

        let (start, end) = local_day_range(NOON_ISH, tz);
        assert_eq!(start, midnight);
        assert_eq!(end, midnight + 86400);
        assert!(start <= NOON_ISH && NOON_ISH < end);
    }

    #[test]
    fn test_seconds_into_local_day() {
        let tz = parse_tz("Etc/UTC");
        assert_eq!(seconds_into_local_day(NOON_ISH, tz), 12 * 3600 + 30 * 60);
    }

    #[test]
    fn test_within_active_hours() {
        let tz = parse_tz("Etc/UTC");
        assert!(within_active_hours(NOON_ISH, tz, 9, 21));
        assert!(!within_active_hours(NOON_ISH, tz, 13, 21));
        // Boundary: window end is exclusive.
        assert!(!within_active_hours(NOON_ISH, tz, 0, 12));
        // Empty and inverted windows never match.
        assert!(!within_active_hours(NOON_ISH, tz, 12, 12));
        assert!(!within_active_hours(NOON_ISH, tz, 21, 9));
    }

    #[test]
    fn test_local_midnight_plus_days() {
        let tz = parse_tz("Etc/UTC");
        let base = local_midnight(NOON_ISH, tz);
        assert_eq!(local_midnight_plus_days(NOON_ISH, tz, 2), base + 2 * 86400);
    }

    #[test]
    fn test_local_days_between() {
        let tz = parse_tz("Etc/UTC");
        assert_eq!(local_days_between(NOON_ISH, NOON_ISH, tz), 0);
        assert_eq!(local_days_between(NOON_ISH, NOON_ISH + 86400, tz), 1);
        // Crossing a single local midnight counts as one day even if the
        // elapsed time is short.
        let late_evening = NOON_ISH + 11 * 3600; // 23:30 local
        let next_morning = late_evening + 3600; // 00:30 local next day
        assert_eq!(local_days_between(late_evening, next_morning, tz), 1);
    }
}
