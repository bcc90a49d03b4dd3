use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use tracing::instrument;

use event_common::event::EventRecord;
use event_common::store::Interval;

use crate::api::AnalyticsError;
use crate::engine::{AnalyticsEngine, Cached};
use crate::funnel::{FunnelQuery, FunnelRequest, FunnelResult};
use crate::journey::{JourneyQuery, JourneyRequest};
use crate::retention::{RetentionQuery, RetentionRequest, RetentionResult};
use crate::timeseries::{MetricsQuery, MetricsRequest, PeriodCount};

/// A successful analytical response. `cached` is only rendered for cache hits.
#[derive(Debug, Serialize)]
pub struct QueryResponse<T> {
    pub success: bool,
    #[serde(flatten)]
    pub body: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

impl<T> From<Cached<T>> for QueryResponse<T> {
    fn from(result: Cached<T>) -> Self {
        QueryResponse {
            success: true,
            body: result.value,
            cached: result.cached.then_some(true),
        }
    }
}

impl<T: Serialize> IntoResponse for QueryResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsBody {
    pub event: String,
    pub interval: Interval,
    pub data: Vec<PeriodCount>,
}

#[derive(Debug, Serialize)]
pub struct JourneyBody {
    pub events: Vec<EventRecord>,
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AnalyticsError> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| AnalyticsError::ValidationError(rejection.body_text()))
}

#[instrument(skip_all, fields(event, cached))]
pub async fn metrics(
    State(engine): State<AnalyticsEngine>,
    params: Result<Query<MetricsRequest>, QueryRejection>,
) -> Result<QueryResponse<MetricsBody>, AnalyticsError> {
    let query = MetricsQuery::try_from(query_params(params)?)?;
    tracing::Span::current().record("event", query.event.as_str());

    let Cached { value, cached } = engine.metrics(&query).await?;
    tracing::Span::current().record("cached", cached);

    Ok(Cached {
        value: MetricsBody {
            event: query.event,
            interval: query.interval,
            data: value,
        },
        cached,
    }
    .into())
}

#[instrument(skip_all, fields(steps, cached))]
pub async fn funnel(
    State(engine): State<AnalyticsEngine>,
    body: Bytes,
) -> Result<QueryResponse<FunnelResult>, AnalyticsError> {
    let request: FunnelRequest = serde_json::from_slice(&body)
        .map_err(|err| AnalyticsError::ValidationError(format!("invalid request body: {err}")))?;
    let query = FunnelQuery::try_from(request)?;
    tracing::Span::current().record("steps", query.steps.len());

    let result = engine.funnel(&query).await?;
    tracing::Span::current().record("cached", result.cached);
    Ok(result.into())
}

#[instrument(skip_all, fields(cohort, days, cached))]
pub async fn retention(
    State(engine): State<AnalyticsEngine>,
    params: Result<Query<RetentionRequest>, QueryRejection>,
) -> Result<QueryResponse<RetentionResult>, AnalyticsError> {
    let query = RetentionQuery::from_request(query_params(params)?, engine.now())?;
    tracing::Span::current().record("cohort", query.cohort.as_str());
    tracing::Span::current().record("days", query.days);

    let result = engine.retention(&query).await?;
    tracing::Span::current().record("cached", result.cached);
    Ok(result.into())
}

#[instrument(skip_all, fields(limit, cached))]
pub async fn journey(
    State(engine): State<AnalyticsEngine>,
    Path(user_id): Path<String>,
    params: Result<Query<JourneyRequest>, QueryRejection>,
) -> Result<QueryResponse<JourneyBody>, AnalyticsError> {
    let query = JourneyQuery::from_request(user_id, query_params(params)?)?;
    tracing::Span::current().record("limit", query.limit);

    let Cached { value, cached } = engine.journey(&query).await?;
    tracing::Span::current().record("cached", cached);

    Ok(Cached {
        value: JourneyBody { events: value },
        cached,
    }
    .into())
}
