use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use event_common::metrics::{track_metrics, with_metrics_route};

use crate::engine::AnalyticsEngine;
use crate::handlers;

pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

async fn index() -> &'static str {
    "analytics"
}

pub fn router(
    engine: AnalyticsEngine,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())))
        .route("/analytics/metrics", get(handlers::metrics))
        .route("/analytics/funnels", post(handlers::funnel))
        .route("/analytics/retention", get(handlers::retention))
        .route("/analytics/users/:id/journey", get(handlers::journey))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(engine);

    match metrics {
        Some(handle) => with_metrics_route(router, handle),
        None => router.layer(axum::middleware::from_fn(track_metrics)),
    }
}
