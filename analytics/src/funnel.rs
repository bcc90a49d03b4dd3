//! Ordered multi-step funnels over each user's first occurrence of every step.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use event_common::cache::QueryKind;
use event_common::event::EventScope;
use event_common::store::{EventFilter, FirstOccurrence, TimeWindow};

use crate::api::{check_window, optional_date, AnalyticsError};
use crate::engine::{AnalyticsEngine, Cached};

pub const MAX_FUNNEL_STEPS: usize = 20;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelRequest {
    pub steps: Option<Vec<String>>,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelQuery {
    #[serde(skip)]
    pub scope: EventScope,
    pub steps: Vec<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl TryFrom<FunnelRequest> for FunnelQuery {
    type Error = AnalyticsError;

    fn try_from(request: FunnelRequest) -> Result<Self, Self::Error> {
        let steps = request.steps.unwrap_or_default();
        if steps.is_empty() || steps.len() > MAX_FUNNEL_STEPS {
            return Err(AnalyticsError::ValidationError(format!(
                "steps must hold between 1 and {MAX_FUNNEL_STEPS} event names"
            )));
        }
        if steps.iter().any(|step| step.trim().is_empty()) {
            return Err(AnalyticsError::ValidationError(
                "steps must not hold empty event names".to_owned(),
            ));
        }

        let start_date = optional_date(request.start_date.as_deref(), "startDate")?;
        let end_date = optional_date(request.end_date.as_deref(), "endDate")?;
        check_window(start_date, end_date)?;

        Ok(FunnelQuery {
            scope: EventScope::new(request.org_id, request.project_id),
            steps,
            start_date,
            end_date,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub step: String,
    /// Users who performed the step, in any order.
    pub users: usize,
    /// Users whose first occurrences of steps 1..=this one are strictly increasing.
    pub users_in_order: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelResult {
    pub total_users: usize,
    pub steps: Vec<FunnelStep>,
}

/// Evaluate `steps` against first occurrences restricted to the step events.
///
/// A user is in order through step `i` when every step up to `i` occurred and
/// each first occurrence is strictly later than the previous one. Ties, and
/// thus a step name repeated later in the funnel, break the order.
pub fn evaluate(steps: &[String], occurrences: &[FirstOccurrence]) -> FunnelResult {
    let mut users: HashMap<&str, HashMap<&str, DateTime<Utc>>> = HashMap::new();
    for occurrence in occurrences {
        users
            .entry(occurrence.user_id.as_str())
            .or_default()
            .entry(occurrence.event_name.as_str())
            .and_modify(|first| *first = (*first).min(occurrence.first_seen))
            .or_insert(occurrence.first_seen);
    }

    let mut result: Vec<FunnelStep> = steps
        .iter()
        .map(|step| FunnelStep {
            step: step.clone(),
            users: 0,
            users_in_order: 0,
        })
        .collect();

    for firsts in users.values() {
        let mut in_order = true;
        let mut previous: Option<DateTime<Utc>> = None;

        for (index, step) in steps.iter().enumerate() {
            let first = firsts.get(step.as_str()).copied();
            if first.is_some() {
                result[index].users += 1;
            }

            in_order = in_order
                && match (previous, first) {
                    (_, None) => false,
                    (None, Some(_)) => true,
                    (Some(previous), Some(first)) => first > previous,
                };
            if in_order {
                result[index].users_in_order += 1;
            }
            previous = first;
        }
    }

    FunnelResult {
        total_users: users.len(),
        steps: result,
    }
}

impl AnalyticsEngine {
    pub async fn funnel(&self, query: &FunnelQuery) -> Result<Cached<FunnelResult>, AnalyticsError> {
        self.cached_or_compute(QueryKind::Funnel, &query.scope, query, move || async move {
            let mut event_names = query.steps.clone();
            event_names.sort();
            event_names.dedup();

            let filter = EventFilter {
                scope: query.scope.clone(),
                event_names: Some(event_names),
                user_ids: None,
                window: TimeWindow::through(
                    Some(query.start_date.unwrap_or_default()),
                    Some(query.end_date.unwrap_or_else(|| self.now())),
                ),
            };

            let occurrences = self.store.first_occurrences(&filter).await?;
            Ok(evaluate(&query.steps, &occurrences))
        })
        .await
    }
}
