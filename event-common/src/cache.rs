//! Query result cache on top of redis.
//!
//! Keys have the shape `analytics:v1:o:<org>:p:<project>:<kind>:<params>`.
//! Scope segments are the base64url of the identifier, or `~` when the query
//! is not filtered on it; `<params>` is the base64url of the remaining query
//! parameters as key-sorted compact JSON. Neither `~` nor `:` belong to the
//! base64url alphabet, so distinct queries never share a key, and scope
//! invalidation can address keys by prefix.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use common_redis::{Client, CustomRedisError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::best_effort::BestEffort;
use crate::event::EventScope;

pub const CACHE_KEY_PREFIX: &str = "analytics:v1";
const UNSCOPED: &str = "~";
const SCAN_COUNT: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Redis(#[from] CustomRedisError),
    #[error("cache entry could not be encoded or decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Metrics,
    Funnel,
    Retention,
    Journey,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Metrics => "metrics",
            QueryKind::Funnel => "funnel",
            QueryKind::Retention => "retention",
            QueryKind::Journey => "journey",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

fn segment(value: Option<&str>) -> String {
    match value {
        Some(value) => URL_SAFE_NO_PAD.encode(value),
        None => UNSCOPED.to_owned(),
    }
}

impl CacheKey {
    /// Fingerprint of a query. `params` holds everything but the scope.
    pub fn new<P: Serialize>(
        kind: QueryKind,
        scope: &EventScope,
        params: &P,
    ) -> Result<Self, CacheError> {
        // Going through `Value` sorts object keys.
        let params = serde_json::to_value(params)?.to_string();
        Ok(CacheKey(format!(
            "{}:o:{}:p:{}:{}:{}",
            CACHE_KEY_PREFIX,
            segment(scope.org_id.as_deref()),
            segment(scope.project_id.as_deref()),
            kind.as_str(),
            URL_SAFE_NO_PAD.encode(params)
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Patterns matching every cached query that can see events of `scope`:
/// queries filtered on the same org (or not on org at all), and likewise for project.
pub fn invalidation_patterns(scope: &EventScope) -> Vec<String> {
    let options = |value: Option<&str>| match value {
        Some(_) => vec![segment(value), UNSCOPED.to_owned()],
        None => vec![UNSCOPED.to_owned()],
    };

    let mut patterns = Vec::new();
    for org in options(scope.org_id.as_deref()) {
        for project in options(scope.project_id.as_deref()) {
            patterns.push(format!("{CACHE_KEY_PREFIX}:o:{org}:p:{project}:*"));
        }
    }
    patterns
}

#[derive(Clone)]
pub struct QueryCache {
    client: Arc<dyn Client + Send + Sync>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(client: Arc<dyn Client + Send + Sync>, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    /// `Ok(None)` on a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> BestEffort<Option<T>, CacheError> {
        let result = match self.client.get(key.as_str().to_owned()).await {
            Ok(raw) => serde_json::from_str(&raw).map(Some).map_err(CacheError::from),
            Err(CustomRedisError::NotFound) => Ok(None),
            Err(error) => Err(CacheError::from(error)),
        };
        result.into()
    }

    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T) -> BestEffort<(), CacheError> {
        let result = match serde_json::to_string(value) {
            Ok(raw) => self
                .client
                .set_ex(key.as_str().to_owned(), raw, self.ttl.as_secs())
                .await
                .map_err(CacheError::from),
            Err(error) => Err(CacheError::from(error)),
        };
        result.into()
    }

    /// Delete every entry that may include events of `scope`. Returns how many were deleted.
    pub async fn invalidate_scope(&self, scope: &EventScope) -> BestEffort<u64, CacheError> {
        self.delete_matching(scope).await.into()
    }

    async fn delete_matching(&self, scope: &EventScope) -> Result<u64, CacheError> {
        let mut deleted = 0;
        for pattern in invalidation_patterns(scope) {
            let keys = self.client.scan_match(pattern, SCAN_COUNT).await?;
            for chunk in keys.chunks(SCAN_COUNT) {
                deleted += self.client.del(chunk.to_vec()).await?;
            }
        }
        debug!(?scope, deleted, "invalidated cached queries");
        Ok(deleted)
    }

    /// Invalidate several scopes, absorbing failures one scope at a time.
    pub async fn invalidate_scopes(&self, scopes: &HashSet<EventScope>) {
        for scope in scopes {
            self.invalidate_scope(scope)
                .await
                .absorb("cache_invalidate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;
    use serde::Deserialize;

    #[derive(Serialize)]
    struct Params<'a> {
        event: &'a str,
        interval: &'a str,
    }

    #[derive(Serialize)]
    struct Reordered<'a> {
        interval: &'a str,
        event: &'a str,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Value {
        total: u32,
        labels: Vec<String>,
    }

    fn scope(org: Option<&str>, project: Option<&str>) -> EventScope {
        EventScope::new(org.map(str::to_owned), project.map(str::to_owned))
    }

    fn cache() -> (QueryCache, MockRedisClient) {
        let client = MockRedisClient::new();
        (
            QueryCache::new(Arc::new(client.clone()), Duration::from_secs(300)),
            client,
        )
    }

    #[test]
    fn keys_ignore_parameter_order() {
        let s = scope(Some("o"), None);
        let a = CacheKey::new(QueryKind::Metrics, &s, &Params { event: "signup", interval: "daily" }).unwrap();
        let b = CacheKey::new(QueryKind::Metrics, &s, &Reordered { interval: "daily", event: "signup" }).unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("analytics:v1:o:bw:p:~:metrics:"));
    }

    #[test]
    fn keys_distinguish_queries() {
        let params = Params { event: "signup", interval: "daily" };
        let base = CacheKey::new(QueryKind::Metrics, &scope(Some("o"), None), &params).unwrap();

        for other in [
            CacheKey::new(QueryKind::Funnel, &scope(Some("o"), None), &params).unwrap(),
            CacheKey::new(QueryKind::Metrics, &scope(None, Some("o")), &params).unwrap(),
            CacheKey::new(QueryKind::Metrics, &scope(None, None), &params).unwrap(),
            CacheKey::new(QueryKind::Metrics, &scope(Some("o"), None), &Params { event: "signup", interval: "weekly" }).unwrap(),
        ] {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn patterns_cover_unscoped_queries() {
        assert_eq!(
            invalidation_patterns(&scope(Some("o"), Some("p"))),
            vec![
                "analytics:v1:o:bw:p:cA:*",
                "analytics:v1:o:bw:p:~:*",
                "analytics:v1:o:~:p:cA:*",
                "analytics:v1:o:~:p:~:*",
            ]
        );
        assert_eq!(
            invalidation_patterns(&scope(None, None)),
            vec!["analytics:v1:o:~:p:~:*"]
        );
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (cache, client) = cache();
        let key = CacheKey::new(QueryKind::Funnel, &scope(Some("o"), Some("p")), &["a", "b"]).unwrap();
        let value = Value { total: 3, labels: vec!["x".to_owned()] };

        assert_eq!(cache.get::<Value>(&key).await.into_result().unwrap(), None);
        assert!(cache.set(&key, &value).await.is_ok());
        assert_eq!(cache.get::<Value>(&key).await.into_result().unwrap(), Some(value));
        assert_eq!(client.ttl(key.as_str()), Some(300));
    }

    #[tokio::test]
    async fn invalidation_only_touches_visible_queries() {
        let (cache, client) = cache();
        let keys = [
            CacheKey::new(QueryKind::Metrics, &scope(Some("o"), Some("p")), &1).unwrap(),
            CacheKey::new(QueryKind::Metrics, &scope(Some("o"), None), &1).unwrap(),
            CacheKey::new(QueryKind::Metrics, &scope(None, None), &1).unwrap(),
            CacheKey::new(QueryKind::Metrics, &scope(Some("o"), Some("other")), &1).unwrap(),
            CacheKey::new(QueryKind::Metrics, &scope(Some("elsewhere"), None), &1).unwrap(),
        ];
        for key in &keys {
            assert!(cache.set(key, &1).await.is_ok());
        }

        let deleted = cache
            .invalidate_scope(&scope(Some("o"), Some("p")))
            .await
            .into_result()
            .unwrap();
        assert_eq!(deleted, 3);

        let mut remaining = vec![keys[3].as_str().to_owned(), keys[4].as_str().to_owned()];
        remaining.sort();
        assert_eq!(client.keys(), remaining);
        assert_eq!(cache.get::<u32>(&keys[0]).await.into_result().unwrap(), None);
    }

    #[tokio::test]
    async fn failures_are_reported_not_raised() {
        let (cache, client) = cache();
        client.set_failing(true);
        let key = CacheKey::new(QueryKind::Journey, &scope(None, None), &"u1").unwrap();

        assert!(!cache.get::<u32>(&key).await.is_ok());
        assert!(!cache.set(&key, &1).await.is_ok());
        assert_eq!(cache.invalidate_scope(&scope(None, None)).await.absorb("test"), None);
    }
}
