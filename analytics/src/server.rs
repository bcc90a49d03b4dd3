use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_redis::RedisClient;
use health::HealthRegistry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use event_common::cache::QueryCache;
use event_common::metrics::setup_metrics_recorder;
use event_common::store::PgEventStore;
use event_common::time::SystemTime;

use crate::config::Config;
use crate::engine::AnalyticsEngine;
use crate::router;

const APP_NAME: &str = "analytics";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(30);

/// Register the server with `liveness` and keep reporting it healthy while the runtime runs.
pub async fn spawn_heartbeat(liveness: &HealthRegistry) -> JoinHandle<()> {
    let handle = liveness.register("http_server", HEARTBEAT_DEADLINE).await;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            handle.report_healthy().await;
        }
    })
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");
    let heartbeat = spawn_heartbeat(&liveness).await;

    let store = PgEventStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.statement_timeout_ms.0,
        APP_NAME,
    )?;
    let redis_client = RedisClient::new(config.redis_url.clone(), config.redis_timeout_ms.0)?;
    let engine = AnalyticsEngine::new(
        Arc::new(store),
        QueryCache::new(Arc::new(redis_client), config.cache_ttl()),
        Arc::new(SystemTime {}),
    );

    let metrics = match config.export_prometheus {
        true => Some(setup_metrics_recorder()?),
        false => None,
    };
    let app = router::router(engine, liveness, metrics);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    heartbeat.abort();

    Ok(())
}
