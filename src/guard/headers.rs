//! Rate limit response headers.

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;

use crate::ratelimit::{RateLimitConfig, RateLimitResult};

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";

/// Header values describing one scope's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// ISO-8601 UTC timestamp of the window reset
    pub reset: String,
}

impl RateLimitHeaders {
    /// Build headers from a check result.
    ///
    /// With `legacy_limit` the limit header carries `total_hits`, matching
    /// what older deployments emitted.
    pub fn new(result: &RateLimitResult, config: &RateLimitConfig, legacy_limit: bool) -> Self {
        let limit = if legacy_limit {
            result.total_hits
        } else {
            config.max_requests()
        };

        Self {
            limit,
            remaining: result.remaining,
            reset: iso_timestamp(result.reset_time),
        }
    }

    /// Header name/value pairs ready to attach to a response.
    pub fn to_pairs(&self) -> [(&'static str, String); 3] {
        [
            (LIMIT_HEADER, self.limit.to_string()),
            (REMAINING_HEADER, self.remaining.to_string()),
            (RESET_HEADER, self.reset.clone()),
        ]
    }
}

fn iso_timestamp(epoch_ms: i64) -> String {
    match Utc.timestamp_millis_opt(epoch_ms).single() {
        Some(at) => at.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => epoch_ms.to_string(),
    }
}
