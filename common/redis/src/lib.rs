use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;
use tracing::warn;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("not found in redis")]
    NotFound,
    #[error("redis command timed out")]
    Timeout,
    #[error("redis error: {0}")]
    Redis(Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

/// A narrow async view over redis, covering what the query cache needs.
#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn set_ex(&self, k: String, v: String, ttl_seconds: u64) -> Result<(), CustomRedisError>;
    /// Returns how many of the keys existed.
    async fn del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError>;
    /// Cursor-based SCAN over keys matching a glob pattern, `count` keys per round trip.
    async fn scan_match(&self, pattern: String, count: usize)
        -> Result<Vec<String>, CustomRedisError>;
}

pub struct RedisClient {
    client: redis::Client,
    timeout: Duration,
}

impl RedisClient {
    pub fn new(addr: String, timeout: Duration) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client, timeout })
    }

    async fn bounded<T, F>(&self, command: &'static str, fut: F) -> Result<T, CustomRedisError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                warn!(command, "redis command failed: {}", error);
                Err(error.into())
            }
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(command, timeout_ms, "redis command timed out");
                Err(CustomRedisError::Timeout)
            }
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CustomRedisError> {
        self.bounded("CONNECT", self.client.get_multiplexed_tokio_connection())
            .await
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = self
            .bounded("GET", redis::cmd("GET").arg(&k).query_async(&mut conn))
            .await?;

        value.ok_or(CustomRedisError::NotFound)
    }

    async fn set_ex(&self, k: String, v: String, ttl_seconds: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection().await?;
        self.bounded(
            "SET",
            redis::cmd("SET")
                .arg(&k)
                .arg(&v)
                .arg("EX")
                .arg(ttl_seconds)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        self.bounded("DEL", redis::cmd("DEL").arg(&keys).query_async(&mut conn))
            .await
    }

    async fn scan_match(
        &self,
        pattern: String,
        count: usize,
    ) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        // Each round trip is bounded on its own so a large keyspace never turns into
        // a single long-running call.
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(count)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// In-memory stand-in for redis, with optional failure injection.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    entries: Arc<Mutex<HashMap<String, (String, u64)>>>,
    failing: Arc<AtomicBool>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        MockRedisClient::default()
    }

    /// Make every subsequent call fail (or succeed again) with a timeout.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn ttl(&self, k: &str) -> Option<u64> {
        self.lock().get(k).map(|(_, ttl)| *ttl)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, u64)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), CustomRedisError> {
        match self.failing.load(Ordering::SeqCst) {
            true => Err(CustomRedisError::Timeout),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        self.check()?;
        self.lock()
            .get(&k)
            .map(|(v, _)| v.clone())
            .ok_or(CustomRedisError::NotFound)
    }

    async fn set_ex(&self, k: String, v: String, ttl_seconds: u64) -> Result<(), CustomRedisError> {
        self.check()?;
        self.lock().insert(k, (v, ttl_seconds));
        Ok(())
    }

    async fn del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError> {
        self.check()?;
        let mut entries = self.lock();
        Ok(keys
            .iter()
            .filter(|k| entries.remove(k.as_str()).is_some())
            .count() as u64)
    }

    async fn scan_match(
        &self,
        pattern: String,
        _count: usize,
    ) -> Result<Vec<String>, CustomRedisError> {
        self.check()?;
        let mut keys: Vec<String> = self
            .lock()
            .keys()
            .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Redis glob subset: `*` and `?`, everything else literal.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match(b"analytics:*", b"analytics:v1:o:~"));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(glob_match(b"*", b""));
        assert!(!glob_match(b"analytics:v1:o:~:*", b"analytics:v1:o:b2E:p:~:metrics"));
        assert!(!glob_match(b"a?c", b"ac"));
    }

    #[tokio::test]
    async fn mock_round_trip_and_delete() {
        let client = MockRedisClient::new();
        client
            .set_ex("k:1".to_owned(), "v".to_owned(), 300)
            .await
            .unwrap();
        client
            .set_ex("k:2".to_owned(), "w".to_owned(), 300)
            .await
            .unwrap();
        client
            .set_ex("other".to_owned(), "x".to_owned(), 300)
            .await
            .unwrap();

        assert_eq!(client.get("k:1".to_owned()).await.unwrap(), "v");
        assert_eq!(client.ttl("k:1"), Some(300));

        let keys = client.scan_match("k:*".to_owned(), 100).await.unwrap();
        assert_eq!(keys, vec!["k:1".to_owned(), "k:2".to_owned()]);
        assert_eq!(client.del(keys).await.unwrap(), 2);
        assert!(matches!(
            client.get("k:1".to_owned()).await,
            Err(CustomRedisError::NotFound)
        ));
        assert_eq!(client.keys(), vec!["other".to_owned()]);
    }

    #[tokio::test]
    async fn commands_are_bounded_by_the_timeout() {
        let client =
            RedisClient::new("redis://127.0.0.1:1".to_owned(), Duration::from_millis(50)).unwrap();

        let stalled = client
            .bounded("GET", std::future::pending::<Result<String, redis::RedisError>>())
            .await;
        assert!(matches!(stalled, Err(CustomRedisError::Timeout)));

        // Nothing listens on port 1: refused or timed out, never a hang.
        assert!(client.get("k".to_owned()).await.is_err());
    }

    #[tokio::test]
    async fn mock_failure_injection() {
        let client = MockRedisClient::new();
        client.set_failing(true);
        assert!(matches!(
            client.get("k".to_owned()).await,
            Err(CustomRedisError::Timeout)
        ));
        client.set_failing(false);
        assert!(matches!(
            client.get("k".to_owned()).await,
            Err(CustomRedisError::NotFound)
        ));
    }
}
