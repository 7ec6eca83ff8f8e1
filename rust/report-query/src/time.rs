//! Time conversions shared by the directory translators and the result mapper.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: i64 = 10_000_000;

/// Converts a UTC timestamp into an Active Directory FILETIME (100ns ticks since 1601).
///
/// `None` when the instant falls before 1601 or past the FILETIME range.
pub fn to_filetime(value: DateTime<Utc>) -> Option<i64> {
    value
        .timestamp()
        .checked_add(FILETIME_EPOCH_OFFSET_SECS)
        .filter(|secs| *secs >= 0)?
        .checked_mul(FILETIME_TICKS_PER_SEC)?
        .checked_add(i64::from(value.timestamp_subsec_nanos() / 100))
}

/// Interprets an Active Directory FILETIME. `0` and `i64::MAX` mean "never".
pub fn from_filetime(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks <= 0 || ticks == i64::MAX {
        return None;
    }
    let secs = ticks / FILETIME_TICKS_PER_SEC - FILETIME_EPOCH_OFFSET_SECS;
    let nanos = (ticks % FILETIME_TICKS_PER_SEC) * 100;
    DateTime::from_timestamp(secs, nanos as u32)
}

/// Parses LDAP generalized time such as `20240115093000.0Z`.
pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim().trim_end_matches('Z');
    let base = trimmed.split(['.', ',']).next()?;
    if base.len() != 14 || !base.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}

/// Best-effort parse of the timestamp formats the backends emit.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    if let Some(dt) = parse_generalized_time(value) {
        return Some(dt);
    }
    // Large integers are FILETIME ticks (AD lastLogonTimestamp, pwdLastSet, ...).
    match value.parse::<i64>() {
        Ok(ticks) if ticks > 100_000_000_000_000 || ticks == 0 => from_filetime(ticks),
        _ => None,
    }
}

pub fn days_ago(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - Duration::days(days)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn filetime_matches_known_value() {
        // 2024-01-01T00:00:00Z
        assert_eq!(
            to_filetime(utc("2024-01-01T00:00:00Z")),
            Some(133_485_408_000_000_000)
        );
        assert_eq!(
            from_filetime(133_485_408_000_000_000),
            Some(utc("2024-01-01T00:00:00Z"))
        );
    }

    #[test]
    fn filetime_never_values_are_none() {
        assert_eq!(from_filetime(0), None);
        assert_eq!(from_filetime(i64::MAX), None);
    }

    #[test]
    fn filetime_rejects_instants_outside_its_range() {
        let far_future = NaiveDate::from_ymd_opt(100_000, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
            .unwrap();
        assert_eq!(to_filetime(far_future), None);
        assert_eq!(to_filetime(utc("1600-12-31T23:59:59Z")), None);
        assert_eq!(to_filetime(utc("1601-01-01T00:00:00Z")), Some(0));
    }

    #[test]
    fn parses_generalized_time() {
        assert_eq!(
            parse_generalized_time("20240115093000.0Z"),
            Some(utc("2024-01-15T09:30:00Z"))
        );
        assert_eq!(parse_generalized_time("2024-01-15"), None);
    }

    #[test]
    fn parse_datetime_accepts_backend_formats() {
        let expected = utc("2024-01-15T09:30:00Z");
        assert_eq!(parse_datetime("2024-01-15T09:30:00Z"), Some(expected));
        assert_eq!(parse_datetime("2024-01-15 09:30:00"), Some(expected));
        assert_eq!(parse_datetime("20240115093000.0Z"), Some(expected));
        assert_eq!(
            parse_datetime("2024-01-15"),
            Some(utc("2024-01-15T00:00:00Z"))
        );
        assert_eq!(parse_datetime("not a date"), None);
        assert_eq!(parse_datetime("42"), None);
    }
}
