//! Configuration management for Bulwark.
//!
//! Service settings (store, guard) come from an optional YAML file. Scope
//! limits are read from the same file and from the environment using the
//! `<SCOPE>_RATE_LIMIT_WINDOW_MS` / `<SCOPE>_RATE_LIMIT_MAX_REQUESTS` names,
//! with the environment taking precedence.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{BulwarkError, Result};
use crate::ratelimit::RateLimitPolicy;

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Guard composition configuration
    #[serde(default)]
    pub guard: GuardConfig,
}

/// Which store backend holds the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Counters in process memory, not shared between processes
    Memory,
    /// Counters in Redis sorted sets
    #[default]
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Optional namespace prepended to every key
    #[serde(default)]
    pub key_namespace: Option<String>,

    /// Client-side timeout for each store call, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_namespace: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Guard configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Report the live hit count in `X-RateLimit-Limit` instead of the
    /// configured maximum, for clients that depend on the old header value.
    #[serde(default)]
    pub legacy_limit_header: bool,
}

impl BulwarkConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BulwarkError::Config(e.to_string()))
    }
}

/// Build the layered settings source used to resolve scope limits.
pub fn limit_settings(path: Option<&Path>) -> Result<config::Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(
            config::File::from(path)
                .format(config::FileFormat::Yaml)
                .required(true),
        );
    }
    let settings = builder
        .add_source(config::Environment::default())
        .build()?;
    Ok(settings)
}

/// Everything needed to assemble a limiter and guard.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: BulwarkConfig,
    pub policy: RateLimitPolicy,
}

impl Settings {
    /// Load service configuration and resolve the scope policy.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                BulwarkConfig::from_file(path)?
            }
            None => BulwarkConfig::default(),
        };
        let policy = RateLimitPolicy::from_settings(&limit_settings(path)?);

        Ok(Self { config, policy })
    }
}
