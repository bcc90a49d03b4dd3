use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_redis::RedisClient;
use health::{ComponentStatus, HealthRegistry};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use event_common::cache::{QueryCache, DEFAULT_TTL};
use event_common::metrics::setup_metrics_recorder;
use event_common::pgqueue::PgQueue;
use event_common::store::{EventStore, MemoryEventStore, PgEventStore};
use event_common::time::SystemTime;

use crate::buffer::{BufferFlusher, EventBuffer};
use crate::config::Config;
use crate::router;
use crate::sinks::{PgQueueSink, PrintSink};

const APP_NAME: &str = "capture";
const FLUSHER_DEADLINE: Duration = Duration::from_secs(30);

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let redis_client = Arc::new(RedisClient::new(
        config.redis_url.clone(),
        config.redis_timeout_ms.0,
    )?);
    let cache = QueryCache::new(redis_client, DEFAULT_TTL);
    let buffer = Arc::new(EventBuffer::new(config.max_buffered_events));
    let metrics = match config.export_prometheus {
        true => Some(setup_metrics_recorder()?),
        false => None,
    };

    let store: Arc<dyn EventStore + Send + Sync> = if config.print_sink {
        // Print sink is only used for local debug, don't allow a container with it to run on prod
        liveness
            .register("print_sink", FLUSHER_DEADLINE)
            .await
            .report_status(ComponentStatus::Unhealthy)
            .await;
        Arc::new(MemoryEventStore::new())
    } else {
        Arc::new(PgEventStore::new(
            &config.database_url,
            config.max_pg_connections,
            config.statement_timeout_ms.0,
            APP_NAME,
        )?)
    };

    let app = if config.print_sink {
        router::router(
            SystemTime {},
            liveness.clone(),
            PrintSink::default(),
            buffer.clone(),
            config.max_batch_size,
            metrics,
        )
    } else {
        let queue = PgQueue::new(
            config.queue_name.as_str(),
            &config.database_url,
            config.max_pg_connections,
            APP_NAME,
        )?;
        router::router(
            SystemTime {},
            liveness.clone(),
            PgQueueSink::new(queue, config.queue_max_attempts),
            buffer.clone(),
            config.max_batch_size,
            metrics,
        )
    };

    let flusher = BufferFlusher::new(
        buffer,
        store,
        cache,
        config.flush_interval_ms.0,
        config.flush_concurrency,
        liveness.register("buffer_flusher", FLUSHER_DEADLINE).await,
    );
    let (stop_flusher, flusher_stopped) = oneshot::channel::<()>();
    let flusher = tokio::spawn(async move {
        flusher
            .run(async move { flusher_stopped.await.unwrap_or_default() })
            .await
    });

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Requests are done: whatever they buffered gets one last flush.
    if stop_flusher.send(()).is_err() {
        tracing::warn!("buffer flusher exited before shutdown");
    }
    flusher.await?;

    Ok(())
}
