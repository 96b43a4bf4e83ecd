//! Redis-backed store using sorted sets.
//!
//! Each key is a ZSET whose members are entry ids scored by their insertion
//! timestamp in epoch milliseconds. Batches go out as a plain pipeline
//! (not MULTI/EXEC), so concurrent checks on one key can interleave.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use tracing::{debug, info};

use super::{RateLimitStore, StoreError, StoreResult};
use crate::ratelimit::RateLimitKey;

/// Rate limit store shared by every process pointing at the same Redis.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    manager: ConnectionManager,
    namespace: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for RedisRateLimitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimitStore")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisRateLimitStore {
    /// Connect to Redis. Every later call is bounded by `timeout`.
    pub async fn connect(
        url: &str,
        namespace: Option<String>,
        timeout: Duration,
    ) -> StoreResult<Self> {
        info!(url = %url, namespace = ?namespace, timeout = ?timeout, "Connecting to Redis");

        let client = redis::Client::open(url)?;
        let manager = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        info!("Redis connection established");
        Ok(Self {
            manager,
            namespace,
            timeout,
        })
    }

    fn redis_key(&self, key: &RateLimitKey) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    /// Run a Redis future under the client timeout.
    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn purge_expired(&self, key: &RateLimitKey, older_than: i64) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let cmd = redis::Cmd::zrembyscore(self.redis_key(key), "-inf", older_than);
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn count(&self, key: &RateLimitKey) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let cmd = redis::Cmd::zcard(self.redis_key(key));
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn add(&self, key: &RateLimitKey, entry_id: &str, timestamp: i64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let cmd = redis::Cmd::zadd(self.redis_key(key), entry_id, timestamp);
        let _added: u64 = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn remove(&self, key: &RateLimitKey, entry_id: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let cmd = redis::Cmd::zrem(self.redis_key(key), entry_id);
        let _removed: u64 = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn expire(&self, key: &RateLimitKey, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let cmd = redis::Cmd::expire(self.redis_key(key), ttl_secs as i64);
        let _set: bool = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn delete(&self, key: &RateLimitKey) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let cmd = redis::Cmd::del(self.redis_key(key));
        let _deleted: u64 = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn record_attempt(
        &self,
        key: &RateLimitKey,
        older_than: i64,
        entry_id: &str,
        timestamp: i64,
        ttl_secs: u64,
    ) -> StoreResult<u64> {
        let redis_key = self.redis_key(key);
        let mut conn = self.manager.clone();

        let mut pipe = redis::pipe();
        pipe.zrembyscore(&redis_key, "-inf", older_than)
            .ignore()
            .zcard(&redis_key)
            .zadd(&redis_key, entry_id, timestamp)
            .ignore()
            .expire(&redis_key, ttl_secs as i64)
            .ignore();

        let (count,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        debug!(key = %redis_key, count = count, "Recorded attempt");
        Ok(count)
    }

    async fn peek(&self, key: &RateLimitKey, older_than: i64) -> StoreResult<u64> {
        let redis_key = self.redis_key(key);
        let mut conn = self.manager.clone();

        let mut pipe = redis::pipe();
        pipe.zrembyscore(&redis_key, "-inf", older_than)
            .ignore()
            .zcard(&redis_key);

        let (count,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs against a live server named by `BULWARK_TEST_REDIS_URL`.
    #[tokio::test]
    #[ignore]
    async fn test_live_sorted_set_round_trip() {
        let url = std::env::var("BULWARK_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let store = RedisRateLimitStore::connect(
            &url,
            Some(format!("bulwark-test-{}", uuid::Uuid::new_v4().simple())),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let key = RateLimitKey::new("rl:test", "live");

        assert_eq!(store.record_attempt(&key, 0, "a", 100, 61).await.unwrap(), 0);
        assert_eq!(store.record_attempt(&key, 0, "b", 200, 61).await.unwrap(), 1);
        assert_eq!(store.peek(&key, 100).await.unwrap(), 1);

        store.remove(&key, "b").await.unwrap();
        assert_eq!(store.count(&key).await.unwrap(), 0);

        store.add(&key, "c", 300).await.unwrap();
        store.delete(&key).await.unwrap();
        assert_eq!(store.count(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        let result = RedisRateLimitStore::connect(
            "redis://127.0.0.1:1",
            None,
            Duration::from_millis(500),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let err = redis::Client::open("not a url").unwrap_err();
        let err: StoreError = err.into();
        assert!(matches!(err, StoreError::Redis(_)));
    }
}
