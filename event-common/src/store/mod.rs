//! Persistence of event records.
//!
//! The store is the only arbiter of uniqueness: `insert_if_absent` is a
//! conditional insert keyed on the record's identity within its org and
//! project, so replaying the same record any number of times leaves one row.
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{EventRecord, EventScope};

pub mod memory;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("record must carry exactly one of eventId and eventHash")]
    InvalidIdentity,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same identity already existed; nothing was written.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hourly,
    Daily,
    Weekly,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("interval must be one of hourly, daily, weekly (got '{0}')")]
pub struct ParseIntervalError(pub String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Interval::Hourly),
            "daily" => Ok(Interval::Daily),
            "weekly" => Ok(Interval::Weekly),
            invalid => Err(ParseIntervalError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interval::Hourly => "hourly",
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
        })
    }
}

impl Interval {
    /// Start of the bucket `ts` falls in. Weeks start on Monday (ISO 8601).
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        let start = match self {
            Interval::Hourly => {
                date.and_time(NaiveTime::from_hms_opt(ts.hour(), 0, 0).unwrap_or_default())
            }
            Interval::Daily => date.and_time(NaiveTime::MIN),
            Interval::Weekly => {
                let monday = date
                    .checked_sub_days(Days::new(u64::from(
                        date.weekday().num_days_from_monday(),
                    )))
                    .unwrap_or(date);
                monday.and_time(NaiveTime::MIN)
            }
        };
        start.and_utc()
    }

    /// Bucket label. Labels sort lexically in chronological order.
    pub fn label(&self, bucket_start: DateTime<Utc>) -> String {
        let format = match self {
            Interval::Hourly => "%Y-%m-%dT%H:00:00Z",
            Interval::Daily => "%Y-%m-%d",
            Interval::Weekly => "%G-W%V",
        };
        bucket_start.format(format).to_string()
    }

    /// Unit understood by postgres' `date_trunc`.
    pub(crate) fn pg_unit(&self) -> &'static str {
        match self {
            Interval::Hourly => "hour",
            Interval::Daily => "day",
            Interval::Weekly => "week",
        }
    }
}

/// Time window starting at `start` inclusive; a missing bound is unbounded.
/// `end` is exclusive unless `end_inclusive` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub end_inclusive: bool,
}

impl TimeWindow {
    /// Half-open `[start, end)`.
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start,
            end,
            end_inclusive: false,
        }
    }

    /// Closed `[start, end]`.
    pub fn through(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start,
            end,
            end_inclusive: true,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| ts >= start)
            && self.end.map_or(true, |end| {
                if self.end_inclusive {
                    ts <= end
                } else {
                    ts < end
                }
            })
    }
}

/// Selection of events shared by every query. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub scope: EventScope,
    pub event_names: Option<Vec<String>>,
    pub user_ids: Option<Vec<String>>,
    pub window: TimeWindow,
}

impl EventFilter {
    pub fn matches(&self, record: &EventRecord) -> bool {
        let in_list = |list: &Option<Vec<String>>, value: &str| {
            list.as_ref()
                .map_or(true, |values| values.iter().any(|v| v == value))
        };
        let in_scope = |wanted: &Option<String>, actual: &Option<String>| {
            wanted.is_none() || wanted == actual
        };

        in_scope(&self.scope.org_id, &record.org_id)
            && in_scope(&self.scope.project_id, &record.project_id)
            && in_list(&self.event_names, &record.event_name)
            && in_list(&self.user_ids, &record.user_id)
            && self.window.contains(record.timestamp)
    }
}

/// Earliest occurrence of an event for a user.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FirstOccurrence {
    pub user_id: String,
    pub event_name: String,
    pub first_seen: DateTime<Utc>,
}

#[async_trait]
pub trait EventStore {
    /// Insert the record unless one with the same identity exists in its scope.
    async fn insert_if_absent(&self, record: &EventRecord) -> Result<InsertOutcome, StoreError>;

    /// Count matching events per bucket, ascending by bucket start. Empty buckets are omitted.
    async fn count_by_period(
        &self,
        filter: &EventFilter,
        interval: Interval,
    ) -> Result<Vec<(DateTime<Utc>, i64)>, StoreError>;

    /// Earliest timestamp of each (user, event name) pair among matching events.
    async fn first_occurrences(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<FirstOccurrence>, StoreError>;

    async fn distinct_users(&self, filter: &EventFilter) -> Result<HashSet<String>, StoreError>;

    /// Matching events ascending by timestamp, ties by ingestion time, at most `limit`.
    async fn find_events(
        &self,
        filter: &EventFilter,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_utils::record;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn truncates_to_bucket_start() {
        let ts = at(2024, 1, 3, 15, 42);
        assert_eq!(Interval::Hourly.truncate(ts), at(2024, 1, 3, 15, 0));
        assert_eq!(Interval::Daily.truncate(ts), at(2024, 1, 3, 0, 0));
        // 2024-01-03 is a Wednesday.
        assert_eq!(Interval::Weekly.truncate(ts), at(2024, 1, 1, 0, 0));
    }

    #[test]
    fn labels_are_sortable() {
        assert_eq!(Interval::Hourly.label(at(2024, 1, 3, 5, 0)), "2024-01-03T05:00:00Z");
        assert_eq!(Interval::Daily.label(at(2024, 1, 3, 0, 0)), "2024-01-03");
        assert_eq!(Interval::Weekly.label(at(2024, 1, 1, 0, 0)), "2024-W01");
        // The ISO week containing 2024-12-30 belongs to 2025.
        assert_eq!(Interval::Weekly.label(at(2024, 12, 30, 0, 0)), "2025-W01");
        assert!(Interval::Weekly.label(at(2024, 3, 4, 0, 0)) < Interval::Weekly.label(at(2024, 11, 4, 0, 0)));
    }

    #[test]
    fn parses_intervals() {
        assert_eq!("weekly".parse::<Interval>(), Ok(Interval::Weekly));
        assert_eq!(
            "monthly".parse::<Interval>(),
            Err(ParseIntervalError("monthly".to_owned()))
        );
    }

    #[test]
    fn window_is_half_open() {
        let window = TimeWindow::new(Some(at(2024, 1, 1, 0, 0)), Some(at(2024, 1, 2, 0, 0)));
        assert!(window.contains(at(2024, 1, 1, 0, 0)));
        assert!(window.contains(at(2024, 1, 1, 23, 59)));
        assert!(!window.contains(at(2024, 1, 2, 0, 0)));
        assert!(TimeWindow::default().contains(at(1970, 1, 1, 0, 0)));
    }

    #[test]
    fn closed_window_keeps_its_end() {
        let window = TimeWindow::through(Some(at(2024, 1, 1, 0, 0)), Some(at(2024, 1, 2, 0, 0)));
        assert!(window.contains(at(2024, 1, 1, 0, 0)));
        assert!(window.contains(at(2024, 1, 2, 0, 0)));
        assert!(!window.contains(at(2024, 1, 2, 0, 1)));
        assert!(TimeWindow::through(None, None).contains(at(1970, 1, 1, 0, 0)));
    }

    #[test]
    fn filter_matching() {
        let event = record("u1", "signup", 1, 0);
        let mut filter = EventFilter::default();
        assert!(filter.matches(&event));

        filter.scope = EventScope::new(Some("o".to_owned()), None);
        assert!(filter.matches(&event));
        filter.scope = EventScope::new(Some("other".to_owned()), None);
        assert!(!filter.matches(&event));

        filter.scope = EventScope::default();
        filter.event_names = Some(vec!["purchase".to_owned()]);
        assert!(!filter.matches(&event));
        filter.event_names = Some(vec!["purchase".to_owned(), "signup".to_owned()]);
        assert!(filter.matches(&event));

        filter.user_ids = Some(vec![]);
        assert!(!filter.matches(&event));
    }
}
