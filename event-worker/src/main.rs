//! Consume `PgQueue` jobs to persist event batches.
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use common_redis::RedisClient;
use envconfig::Envconfig;
use health::HealthRegistry;

use event_common::cache::{QueryCache, DEFAULT_TTL};
use event_common::metrics::{serve, setup_metrics_recorder, with_metrics_route};
use event_common::pgqueue::PgQueue;
use event_common::retry::RetryPolicy;
use event_common::store::PgEventStore;
use event_worker::config::Config;
use event_worker::worker::EventWorker;

const APP_NAME: &str = "event-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let liveness = HealthRegistry::new("liveness");

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .queue(
        config
            .retry_policy
            .retry_queue_name
            .as_ref()
            .map(|name| name.as_str()),
    )
    .provide();
    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        APP_NAME,
    )?;
    let store = PgEventStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.statement_timeout_ms.0,
        APP_NAME,
    )?;
    let redis_client = RedisClient::new(config.redis_url.clone(), config.redis_timeout_ms.0)?;

    let worker_liveness = liveness
        .register("worker", (config.poll_interval.0 * 4).max(Duration::from_secs(5)))
        .await;

    let worker = EventWorker::new(
        &config.worker_name,
        &queue,
        Arc::new(store),
        QueryCache::new(Arc::new(redis_client), DEFAULT_TTL),
        config.poll_interval.0,
        config.dequeue_batch_size,
        config.max_concurrent_jobs,
        config.upsert_concurrency,
        retry_policy,
        worker_liveness,
    );

    let recorder_handle = setup_metrics_recorder()?;
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        );
    let router = with_metrics_route(router, recorder_handle);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            tracing::error!("failed to serve metrics: {}", error);
        }
    });

    worker.run().await;

    Ok(())
}

pub async fn index() -> &'static str {
    "event worker"
}
