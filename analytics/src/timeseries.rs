//! Event counts bucketed by hour, day or ISO week.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use event_common::cache::QueryKind;
use event_common::event::EventScope;
use event_common::store::{EventFilter, Interval, TimeWindow};

use crate::api::{check_window, optional_date, required, AnalyticsError};
use crate::engine::{AnalyticsEngine, Cached};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRequest {
    pub event: Option<String>,
    pub interval: Option<String>,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    #[serde(skip)]
    pub scope: EventScope,
    pub event: String,
    pub interval: Interval,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl TryFrom<MetricsRequest> for MetricsQuery {
    type Error = AnalyticsError;

    fn try_from(request: MetricsRequest) -> Result<Self, Self::Error> {
        let interval = match request.interval.as_deref() {
            None | Some("") => Interval::Daily,
            Some(value) => value
                .parse()
                .map_err(|err: event_common::store::ParseIntervalError| {
                    AnalyticsError::ValidationError(err.to_string())
                })?,
        };
        let start_date = optional_date(request.start_date.as_deref(), "startDate")?;
        let end_date = optional_date(request.end_date.as_deref(), "endDate")?;
        check_window(start_date, end_date)?;

        Ok(MetricsQuery {
            scope: EventScope::new(request.org_id, request.project_id),
            event: required(request.event, "event")?,
            interval,
            start_date,
            end_date,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCount {
    pub period: String,
    pub count: i64,
}

impl AnalyticsEngine {
    /// Non-empty buckets of `[start, end)`, ascending. The window defaults to all history up to now.
    pub async fn metrics(&self, query: &MetricsQuery) -> Result<Cached<Vec<PeriodCount>>, AnalyticsError> {
        self.cached_or_compute(QueryKind::Metrics, &query.scope, query, move || async move {
            let filter = EventFilter {
                scope: query.scope.clone(),
                event_names: Some(vec![query.event.clone()]),
                user_ids: None,
                window: TimeWindow::new(
                    // The default `DateTime` is the Unix epoch.
                    Some(query.start_date.unwrap_or_default()),
                    Some(query.end_date.unwrap_or_else(|| self.now())),
                ),
            };

            let buckets = self.store.count_by_period(&filter, query.interval).await?;
            Ok(buckets
                .into_iter()
                .map(|(start, count)| PeriodCount {
                    period: query.interval.label(start),
                    count,
                })
                .collect())
        })
        .await
    }
}
