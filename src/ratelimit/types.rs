//! Rate limit configuration and result types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BulwarkError, Result};

/// Longest accepted window: one year.
pub const MAX_WINDOW_MS: u64 = 366 * 24 * 60 * 60 * 1000;

/// Sliding window configuration for a single scope.
///
/// Immutable once built: `0 < window_ms <= MAX_WINDOW_MS` and
/// `max_requests >= 1` are checked at construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    window_ms: u64,
    max_requests: u64,
    key_prefix: String,
}

#[derive(Deserialize)]
struct RawRateLimitConfig {
    window_ms: u64,
    max_requests: u64,
    key_prefix: String,
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = BulwarkError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        Self::new(raw.window_ms, raw.max_requests, raw.key_prefix)
    }
}

impl RateLimitConfig {
    /// Create a validated configuration.
    pub fn new(window_ms: u64, max_requests: u64, key_prefix: impl Into<String>) -> Result<Self> {
        if window_ms == 0 {
            return Err(BulwarkError::InvalidLimit(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if window_ms > MAX_WINDOW_MS {
            return Err(BulwarkError::InvalidLimit(format!(
                "window_ms must not exceed {}",
                MAX_WINDOW_MS
            )));
        }
        if max_requests == 0 {
            return Err(BulwarkError::InvalidLimit(
                "max_requests must be at least one".to_string(),
            ));
        }

        Ok(Self {
            window_ms,
            max_requests,
            key_prefix: key_prefix.into(),
        })
    }

    /// Configuration from constants known to satisfy the invariants.
    pub(crate) fn builtin(window_ms: u64, max_requests: u64, key_prefix: String) -> Self {
        debug_assert!(window_ms > 0 && window_ms <= MAX_WINDOW_MS && max_requests > 0);
        Self {
            window_ms,
            max_requests,
            key_prefix,
        }
    }

    /// Length of the sliding window in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Window length as a signed offset for epoch millisecond arithmetic.
    pub fn window_offset(&self) -> i64 {
        // Bounded by MAX_WINDOW_MS, so this never truncates.
        self.window_ms as i64
    }

    /// Epoch milliseconds at which a window starting at `now` resets.
    pub fn reset_time(&self, now: i64) -> i64 {
        now.saturating_add(self.window_offset())
    }

    /// Entries scored at or below this bound have left the window at `now`.
    pub fn window_start(&self, now: i64) -> i64 {
        now.saturating_sub(self.window_offset())
    }

    /// Length of the sliding window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Maximum admitted attempts within one window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Namespace prepended to every key of this scope.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// TTL applied to the backing key: whole seconds of the window plus a
    /// one minute grace so abandoned keys expire on their own.
    pub fn key_ttl_secs(&self) -> u64 {
        self.window_ms.div_ceil(1000) + 60
    }
}

/// Outcome of a single check. Built fresh per call and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// Whether the attempt was admitted
    pub allowed: bool,
    /// Attempts still available in the current window
    pub remaining: u64,
    /// Epoch milliseconds at which the window is considered reset
    pub reset_time: i64,
    /// Attempts counted in the window, including this one when admitted
    pub total_hits: u64,
}

impl RateLimitResult {
    /// Result returned by `check_and_consume` when the store cannot be reached.
    pub fn fail_open_consume(config: &RateLimitConfig, now: i64) -> Self {
        Self {
            allowed: true,
            remaining: config.max_requests - 1,
            reset_time: config.reset_time(now),
            total_hits: 1,
        }
    }

    /// Result returned by `status` when the store cannot be reached. Nothing
    /// was recorded, so no hit is reported.
    pub fn fail_open_status(config: &RateLimitConfig, now: i64) -> Self {
        Self {
            allowed: true,
            remaining: config.max_requests - 1,
            reset_time: config.reset_time(now),
            total_hits: 0,
        }
    }

    /// Milliseconds left until `reset_time`, clamped at zero.
    pub fn millis_until_reset(&self, now: i64) -> u64 {
        self.reset_time.saturating_sub(now).max(0) as u64
    }

    /// Whole seconds until reset, rounded up.
    pub fn secs_until_reset(&self, now: i64) -> u64 {
        self.millis_until_reset(now).div_ceil(1000)
    }
}
