//! Day-by-day retention of the users who performed a cohort event on one day.
use chrono::{DateTime, Days, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use event_common::cache::QueryKind;
use event_common::event::EventScope;
use event_common::store::{EventFilter, TimeWindow};
use event_common::time::start_of_day;

use crate::api::{bounded, optional_date, required, AnalyticsError};
use crate::engine::{AnalyticsEngine, Cached};

pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const MAX_RETENTION_DAYS: u32 = 365;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRequest {
    pub cohort: Option<String>,
    pub start_date: Option<String>,
    pub days: Option<String>,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionQuery {
    #[serde(skip)]
    pub scope: EventScope,
    pub cohort: String,
    /// Midnight UTC of the cohort day.
    pub start_date: DateTime<Utc>,
    pub days: u32,
}

impl RetentionQuery {
    /// The cohort day defaults to a week before today.
    pub fn from_request(request: RetentionRequest, now: DateTime<Utc>) -> Result<Self, AnalyticsError> {
        let cohort = required(request.cohort, "cohort")?;
        let days = bounded(
            request.days.as_deref(),
            "days",
            DEFAULT_RETENTION_DAYS,
            1,
            MAX_RETENTION_DAYS,
        )?;
        let start_date = match optional_date(request.start_date.as_deref(), "startDate")? {
            Some(start) => start_of_day(start),
            None => start_of_day(now) - Days::new(7),
        };

        Ok(RetentionQuery {
            scope: EventScope::new(request.org_id, request.project_id),
            cohort,
            start_date,
            days,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionDay {
    pub day: u32,
    pub count: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionResult {
    pub cohort_size: usize,
    pub retention: Vec<RetentionDay>,
}

/// Share of the cohort, in percent rounded to two decimals.
pub fn percent(count: usize, cohort_size: usize) -> f64 {
    if cohort_size == 0 {
        return 0.0;
    }
    (count as f64 / cohort_size as f64 * 10000.0).round() / 100.0
}

fn day_window(start: DateTime<Utc>, offset: u32) -> TimeWindow {
    let day_start = start + Days::new(u64::from(offset));
    TimeWindow::new(Some(day_start), Some(day_start + Days::new(1)))
}

impl AnalyticsEngine {
    pub async fn retention(&self, query: &RetentionQuery) -> Result<Cached<RetentionResult>, AnalyticsError> {
        self.cached_or_compute(QueryKind::Retention, &query.scope, query, move || async move {
            let cohort = self
                .store
                .distinct_users(&EventFilter {
                    scope: query.scope.clone(),
                    event_names: Some(vec![query.cohort.clone()]),
                    user_ids: None,
                    window: day_window(query.start_date, 0),
                })
                .await?;

            if cohort.is_empty() {
                return Ok(RetentionResult {
                    cohort_size: 0,
                    retention: Vec::new(),
                });
            }

            let cohort_ids: Vec<String> = cohort.iter().cloned().collect();
            let active = try_join_all((0..query.days).map(|offset| {
                let filter = EventFilter {
                    scope: query.scope.clone(),
                    event_names: None,
                    user_ids: Some(cohort_ids.clone()),
                    window: day_window(query.start_date, offset),
                };
                async move { self.store.distinct_users(&filter).await }
            }))
            .await?;

            let retention = active
                .into_iter()
                .zip(0..)
                .map(|(users, day)| {
                    let count = users.intersection(&cohort).count();
                    RetentionDay {
                        day,
                        count,
                        percent: percent(count, cohort.len()),
                    }
                })
                .collect();

            Ok(RetentionResult {
                cohort_size: cohort.len(),
                retention,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 13, 30, 0).unwrap()
    }

    #[test]
    fn percent_rounds_to_two_decimals() {
        assert_eq!(percent(2, 4), 50.0);
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(2, 3), 66.67);
        assert_eq!(percent(3, 3), 100.0);
        assert_eq!(percent(0, 0), 0.0);
    }

    #[test]
    fn defaults() {
        let query = RetentionQuery::from_request(
            RetentionRequest {
                cohort: Some("signup".to_owned()),
                ..Default::default()
            },
            now(),
        )
        .unwrap();

        assert_eq!(query.days, DEFAULT_RETENTION_DAYS);
        assert_eq!(query.start_date, Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap());
    }

    #[test]
    fn start_is_truncated_to_midnight() {
        let query = RetentionQuery::from_request(
            RetentionRequest {
                cohort: Some("signup".to_owned()),
                start_date: Some("2024-01-03T18:45:00Z".to_owned()),
                days: Some("3".to_owned()),
                ..Default::default()
            },
            now(),
        )
        .unwrap();

        assert_eq!(query.start_date, Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        assert_eq!(query.days, 3);
    }

    #[test]
    fn rejects_invalid_requests() {
        assert!(RetentionQuery::from_request(RetentionRequest::default(), now()).is_err());
        assert!(RetentionQuery::from_request(
            RetentionRequest {
                cohort: Some("signup".to_owned()),
                days: Some("0".to_owned()),
                ..Default::default()
            },
            now()
        )
        .is_err());
    }
}
