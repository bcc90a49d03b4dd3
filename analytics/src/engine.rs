use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;

use event_common::cache::{CacheKey, QueryCache, QueryKind};
use event_common::event::EventScope;
use event_common::store::EventStore;
use event_common::time::TimeSource;

use crate::api::AnalyticsError;

/// A query result, and whether it came from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub cached: bool,
}

/// Runs analytical queries against the event store, through the query cache.
#[derive(Clone)]
pub struct AnalyticsEngine {
    pub(crate) store: Arc<dyn EventStore + Send + Sync>,
    cache: QueryCache,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl AnalyticsEngine {
    pub fn new(
        store: Arc<dyn EventStore + Send + Sync>,
        cache: QueryCache,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            store,
            cache,
            timesource,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.timesource.now()
    }

    /// Serve the query from the cache, or compute and cache it.
    ///
    /// Cache failures only cost a recomputation. `params` must hold every
    /// input of `compute` apart from the scope.
    pub async fn cached_or_compute<P, T, F, Fut>(
        &self,
        kind: QueryKind,
        scope: &EventScope,
        params: &P,
        compute: F,
    ) -> Result<Cached<T>, AnalyticsError>
    where
        P: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AnalyticsError>>,
    {
        let key = CacheKey::new(kind, scope, params)?;

        if let Some(Some(value)) = self.cache.get::<T>(&key).await.absorb("cache_get") {
            counter!("analytics_queries_total", "query" => kind.as_str(), "cache" => "hit")
                .increment(1);
            return Ok(Cached {
                value,
                cached: true,
            });
        }
        counter!("analytics_queries_total", "query" => kind.as_str(), "cache" => "miss")
            .increment(1);

        let value = compute().await?;
        self.cache.set(&key, &value).await.absorb("cache_set");

        Ok(Cached {
            value,
            cached: false,
        })
    }
}
