//! Rate limiting logic: keys, scope policy and the sliding window limiter.

mod key;
mod limiter;
mod policy;
mod types;

pub use key::RateLimitKey;
pub use limiter::{now_ms, SlidingWindowLimiter};
pub use policy::{RateLimitPolicy, Scope, SettingsSource};
pub use types::{RateLimitConfig, RateLimitResult, MAX_WINDOW_MS};
