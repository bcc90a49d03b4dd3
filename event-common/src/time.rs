use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc};
use thiserror::Error;

pub trait TimeSource {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }
}

/// A clock stuck at one instant, for tests.
#[derive(Clone)]
pub struct FixedTime {
    pub time: DateTime<Utc>,
}

impl TimeSource for FixedTime {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("'{0}' is not a valid ISO-8601 timestamp")]
pub struct TimestampParseError(pub String);

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parse a client-supplied timestamp into UTC with millisecond precision.
///
/// Accepts RFC 3339 with any offset, date-times without an offset (read as
/// UTC), and bare dates (midnight UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampParseError> {
    let value = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc).trunc_subsecs(3));
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed.and_utc().trunc_subsecs(3));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }

    Err(TimestampParseError(value.to_owned()))
}

/// Midnight UTC of the day `ts` falls in.
pub fn start_of_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_with_offsets() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-01T00:00:00Z").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2024-01-01T02:00:00+02:00").unwrap(),
            expected
        );
    }

    #[test]
    fn parses_naive_and_date_only_as_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 10, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-05T10:30:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-05 10:30:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2024-03-05").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn truncates_to_milliseconds() {
        let parsed = parse_timestamp("2024-01-01T00:00:00.123456789Z").unwrap();
        assert_eq!(parsed.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            parse_timestamp("yesterday"),
            Err(TimestampParseError("yesterday".to_owned()))
        );
        assert!(parse_timestamp("2024-13-01").is_err());
    }

    #[test]
    fn start_of_day_truncates() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 23, 59, 59).unwrap();
        assert_eq!(
            start_of_day(ts),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
        );
    }
}
