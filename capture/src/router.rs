use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use event_common::metrics::{track_metrics, with_metrics_route};
use event_common::time::TimeSource;

use crate::buffer::EventBuffer;
use crate::{capture, sinks};

pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn sinks::EventSink + Send + Sync>,
    pub buffer: Arc<EventBuffer>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub max_batch_size: usize,
}

async fn index() -> &'static str {
    "capture"
}

pub fn router<
    TZ: TimeSource + Send + Sync + 'static,
    S: sinks::EventSink + Send + Sync + 'static,
>(
    timesource: TZ,
    liveness: HealthRegistry,
    sink: S,
    buffer: Arc<EventBuffer>,
    max_batch_size: usize,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = State {
        sink: Arc::new(sink),
        buffer,
        timesource: Arc::new(timesource),
        max_batch_size,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())))
        .route("/events", post(capture::event))
        .route("/events/batch", post(capture::batch))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(state);

    // Installing a global recorder when capture is used as a library (during tests etc)
    // does not work well, so the caller decides.
    match metrics {
        Some(handle) => with_metrics_route(router, handle),
        None => router.layer(axum::middleware::from_fn(track_metrics)),
    }
}
