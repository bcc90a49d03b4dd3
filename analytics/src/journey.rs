//! A single user's events in occurrence order.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use event_common::cache::QueryKind;
use event_common::event::{EventRecord, EventScope};
use event_common::store::{EventFilter, TimeWindow};

use crate::api::{bounded, check_window, optional_date, AnalyticsError};
use crate::engine::{AnalyticsEngine, Cached};

pub const DEFAULT_JOURNEY_LIMIT: u32 = 100;
pub const MAX_JOURNEY_LIMIT: u32 = 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneyRequest {
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneyQuery {
    #[serde(skip)]
    pub scope: EventScope,
    pub user_id: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl JourneyQuery {
    pub fn from_request(user_id: String, request: JourneyRequest) -> Result<Self, AnalyticsError> {
        if user_id.trim().is_empty() {
            return Err(AnalyticsError::ValidationError("userId is required".to_owned()));
        }
        let limit = bounded(
            request.limit.as_deref(),
            "limit",
            DEFAULT_JOURNEY_LIMIT,
            1,
            MAX_JOURNEY_LIMIT,
        )?;
        let start_date = optional_date(request.start_date.as_deref(), "startDate")?;
        let end_date = optional_date(request.end_date.as_deref(), "endDate")?;
        check_window(start_date, end_date)?;

        Ok(JourneyQuery {
            scope: EventScope::new(request.org_id, request.project_id),
            user_id,
            start_date,
            end_date,
            limit,
        })
    }
}

impl AnalyticsEngine {
    /// Events in `[start, end]` ascending by timestamp, ties by ingestion time. Unbounded dates stay unbounded.
    pub async fn journey(&self, query: &JourneyQuery) -> Result<Cached<Vec<EventRecord>>, AnalyticsError> {
        self.cached_or_compute(QueryKind::Journey, &query.scope, query, move || async move {
            let filter = EventFilter {
                scope: query.scope.clone(),
                event_names: None,
                user_ids: Some(vec![query.user_id.clone()]),
                window: TimeWindow::through(query.start_date, query.end_date),
            };

            Ok(self
                .store
                .find_events(&filter, i64::from(query.limit))
                .await?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_bounds() {
        let query = JourneyQuery::from_request("u1".to_owned(), JourneyRequest::default()).unwrap();
        assert_eq!(query.limit, DEFAULT_JOURNEY_LIMIT);
        assert_eq!(query.start_date, None);

        for limit in ["0", "1001", "ten"] {
            let request = JourneyRequest {
                limit: Some(limit.to_owned()),
                ..Default::default()
            };
            assert!(
                JourneyQuery::from_request("u1".to_owned(), request).is_err(),
                "limit {limit} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_inverted_windows() {
        let request = JourneyRequest {
            start_date: Some("2024-01-02".to_owned()),
            end_date: Some("2024-01-01".to_owned()),
            ..Default::default()
        };
        assert!(JourneyQuery::from_request("u1".to_owned(), request).is_err());
    }
}
