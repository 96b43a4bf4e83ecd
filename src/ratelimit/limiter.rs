//! Sliding window log limiter.
//!
//! Every attempt is recorded as a timestamped entry under its key. An attempt
//! is admitted when fewer than `max_requests` entries fall inside the trailing
//! window. Rejected attempts are removed again so retries do not keep the
//! window full.
//!
//! The purge/count/insert batch is not a transaction. Concurrent checks on the
//! same key can observe the same count and all be admitted, so bursts may
//! exceed the limit by up to the number of in-flight checks.

use std::sync::Arc;

use tracing::{debug, error, trace};

use super::key::RateLimitKey;
use super::types::{RateLimitConfig, RateLimitResult};
use crate::store::{RateLimitStore, StoreResult};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The sliding window rate limiter.
///
/// Holds no mutable state of its own; all counters live in the store, so one
/// instance can be shared freely across tasks.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter").finish_non_exhaustive()
    }
}

impl SlidingWindowLimiter {
    /// Create a limiter over the given store.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Record an attempt for `key` now and decide whether it is admitted.
    pub async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
    ) -> RateLimitResult {
        self.check_and_consume_at(key, config, now_ms()).await
    }

    /// Record an attempt for `key` at `now` (epoch ms) and decide whether it is
    /// admitted.
    ///
    /// Never fails: if the store cannot be reached the attempt is admitted.
    pub async fn check_and_consume_at(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        now: i64,
    ) -> RateLimitResult {
        trace!(key = %key, now = now, "Checking rate limit");

        match self.try_consume(key, config, now).await {
            Ok(result) => {
                if !result.allowed {
                    debug!(
                        key = %key,
                        total_hits = result.total_hits,
                        limit = config.max_requests(),
                        "Rate limit exceeded"
                    );
                }
                result
            }
            Err(e) => {
                error!(key = %key, error = %e, "Rate limit store failed, allowing request");
                RateLimitResult::fail_open_consume(config, now)
            }
        }
    }

    async fn try_consume(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        now: i64,
    ) -> StoreResult<RateLimitResult> {
        let window_start = config.window_start(now);
        let entry_id = format!("{}-{}", now, uuid::Uuid::new_v4().simple());

        let count = self
            .store
            .record_attempt(key, window_start, &entry_id, now, config.key_ttl_secs())
            .await?;

        let allowed = count < config.max_requests();
        if !allowed {
            self.store.remove(key, &entry_id).await?;
        }

        let admitted = u64::from(allowed);
        Ok(RateLimitResult {
            allowed,
            remaining: config.max_requests().saturating_sub(count + admitted),
            reset_time: config.reset_time(now),
            total_hits: count + admitted,
        })
    }

    /// Report the state of `key` now without recording anything.
    pub async fn status(&self, key: &RateLimitKey, config: &RateLimitConfig) -> RateLimitResult {
        self.status_at(key, config, now_ms()).await
    }

    /// Report the state of `key` at `now` without recording anything.
    ///
    /// `allowed` tells whether a further attempt would currently be admitted.
    pub async fn status_at(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        now: i64,
    ) -> RateLimitResult {
        let window_start = config.window_start(now);

        match self.store.peek(key, window_start).await {
            Ok(count) => RateLimitResult {
                allowed: count < config.max_requests(),
                remaining: config.max_requests().saturating_sub(count),
                reset_time: config.reset_time(now),
                total_hits: count,
            },
            Err(e) => {
                error!(key = %key, error = %e, "Rate limit store failed during status");
                RateLimitResult::fail_open_status(config, now)
            }
        }
    }

    /// Forget every recorded attempt for `key`. Best effort.
    pub async fn reset(&self, key: &RateLimitKey) {
        match self.store.delete(key).await {
            Ok(()) => debug!(key = %key, "Rate limit reset"),
            Err(e) => error!(key = %key, error = %e, "Failed to reset rate limit"),
        }
    }
}
