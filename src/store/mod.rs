//! Shared store abstraction for sliding window counters.
//!
//! A store holds one time-sorted set of entries per key. Every operation is a
//! network call in production and may fail or time out; the limiter treats
//! any failure as a signal to fail open.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::ratelimit::RateLimitKey;

pub use memory::{MemoryRateLimitStore, DEFAULT_SWEEP_INTERVAL};
#[cfg(feature = "redis")]
pub use self::redis::RedisRateLimitStore;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the command
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the client timeout
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Redis protocol or connection error
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Sorted-set primitives the sliding window limiter is built on.
///
/// The batched methods have default implementations composed from the single
/// operations. Backends that can pipeline should override them so one check
/// costs one round trip. Batches are not transactions: concurrent callers on
/// the same key may interleave between the operations of a batch.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Remove entries scored at or below `older_than`, returning how many went.
    async fn purge_expired(&self, key: &RateLimitKey, older_than: i64) -> StoreResult<u64>;

    /// Number of entries currently held under `key`.
    async fn count(&self, key: &RateLimitKey) -> StoreResult<u64>;

    /// Insert `entry_id` scored by `timestamp`.
    async fn add(&self, key: &RateLimitKey, entry_id: &str, timestamp: i64) -> StoreResult<()>;

    /// Remove a single entry.
    async fn remove(&self, key: &RateLimitKey, entry_id: &str) -> StoreResult<()>;

    /// Set the key's time to live. A missing key is left alone.
    async fn expire(&self, key: &RateLimitKey, ttl_secs: u64) -> StoreResult<()>;

    /// Drop the key and all of its entries.
    async fn delete(&self, key: &RateLimitKey) -> StoreResult<()>;

    /// Purge, count, insert and refresh the TTL as one batch.
    ///
    /// Returns the count observed before the insert.
    async fn record_attempt(
        &self,
        key: &RateLimitKey,
        older_than: i64,
        entry_id: &str,
        timestamp: i64,
        ttl_secs: u64,
    ) -> StoreResult<u64> {
        self.purge_expired(key, older_than).await?;
        let count = self.count(key).await?;
        self.add(key, entry_id, timestamp).await?;
        self.expire(key, ttl_secs).await?;
        Ok(count)
    }

    /// Purge and count without recording anything.
    async fn peek(&self, key: &RateLimitKey, older_than: i64) -> StoreResult<u64> {
        self.purge_expired(key, older_than).await?;
        self.count(key).await
    }
}

/// Build the store selected by configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn RateLimitStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-process rate limit store");
            Ok(Arc::new(MemoryRateLimitStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = RedisRateLimitStore::connect(
                &config.redis_url,
                config.key_namespace.clone(),
                config.timeout(),
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(crate::error::BulwarkError::Config(
            "redis backend requested but the `redis` feature is disabled".to_string(),
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store doubles for exercising failure paths.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Wraps a store and fails every call while `failing` is set.
    pub struct FailingStore {
        inner: MemoryRateLimitStore,
        failing: AtomicBool,
        fail_remove_only: bool,
        pub calls: AtomicUsize,
    }

    impl FailingStore {
        /// A store that is down for every operation.
        pub fn down() -> Self {
            Self {
                inner: MemoryRateLimitStore::new(),
                failing: AtomicBool::new(true),
                fail_remove_only: false,
                calls: AtomicUsize::new(0),
            }
        }

        /// A store that only fails the compensating `remove`.
        pub fn failing_remove() -> Self {
            Self {
                fail_remove_only: true,
                ..Self::down()
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self, op: &str) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let applies = !self.fail_remove_only || op == "remove";
            if applies && self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable(format!("{op}: connection refused")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn purge_expired(&self, key: &RateLimitKey, older_than: i64) -> StoreResult<u64> {
            self.check("purge_expired")?;
            self.inner.purge_expired(key, older_than).await
        }

        async fn count(&self, key: &RateLimitKey) -> StoreResult<u64> {
            self.check("count")?;
            self.inner.count(key).await
        }

        async fn add(&self, key: &RateLimitKey, entry_id: &str, timestamp: i64) -> StoreResult<()> {
            self.check("add")?;
            self.inner.add(key, entry_id, timestamp).await
        }

        async fn remove(&self, key: &RateLimitKey, entry_id: &str) -> StoreResult<()> {
            self.check("remove")?;
            self.inner.remove(key, entry_id).await
        }

        async fn expire(&self, key: &RateLimitKey, ttl_secs: u64) -> StoreResult<()> {
            self.check("expire")?;
            self.inner.expire(key, ttl_secs).await
        }

        async fn delete(&self, key: &RateLimitKey) -> StoreResult<()> {
            self.check("delete")?;
            self.inner.delete(key).await
        }
    }
}
