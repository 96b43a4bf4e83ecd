//! Scope definitions and their resolved limits.
//!
//! Each scope reads `<STEM>_RATE_LIMIT_WINDOW_MS` and
//! `<STEM>_RATE_LIMIT_MAX_REQUESTS` from a settings source and falls back to
//! its built-in default when a value is absent or unusable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, warn};

use super::key::RateLimitKey;
use super::types::{RateLimitConfig, MAX_WINDOW_MS};
use crate::error::{BulwarkError, Result};

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// An independent rate limiting dimension with its own budget and key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// Tenants created by one user
    TenantCreation,
    /// Tenants joined by one user
    TenantJoining,
    /// Invitations accepted by one user
    InvitationAcceptance,
    /// Invitations sent from one tenant
    InvitationByTenant,
    /// Invitations sent by one admin
    InvitationByAdmin,
    /// Invitation operations from one IP address
    InvitationByIp,
    /// Invitations addressed to one email
    InvitationByEmail,
}

impl Scope {
    /// Every scope, in declaration order.
    pub const ALL: [Scope; 7] = [
        Scope::TenantCreation,
        Scope::TenantJoining,
        Scope::InvitationAcceptance,
        Scope::InvitationByTenant,
        Scope::InvitationByAdmin,
        Scope::InvitationByIp,
        Scope::InvitationByEmail,
    ];

    /// Stable, human readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Scope::TenantCreation => "tenant-creation",
            Scope::TenantJoining => "tenant-joining",
            Scope::InvitationAcceptance => "invitation-acceptance",
            Scope::InvitationByTenant => "invitation-tenant",
            Scope::InvitationByAdmin => "invitation-admin",
            Scope::InvitationByIp => "invitation-ip",
            Scope::InvitationByEmail => "invitation-email",
        }
    }

    /// Prefix of the settings names that override this scope.
    pub fn settings_stem(&self) -> &'static str {
        match self {
            Scope::TenantCreation => "TENANT_CREATION",
            Scope::TenantJoining => "TENANT_JOINING",
            Scope::InvitationAcceptance => "INVITATION_ACCEPTANCE",
            Scope::InvitationByTenant => "INVITATION_TENANT",
            Scope::InvitationByAdmin => "INVITATION_ADMIN",
            Scope::InvitationByIp => "INVITATION_IP",
            Scope::InvitationByEmail => "INVITATION_EMAIL",
        }
    }

    /// Key namespace for this scope's counters.
    pub fn key_prefix(&self) -> String {
        format!("rl:{}", self.name())
    }

    pub fn default_window_ms(&self) -> u64 {
        match self {
            Scope::InvitationByTenant | Scope::InvitationByEmail => DAY_MS,
            _ => HOUR_MS,
        }
    }

    pub fn default_max_requests(&self) -> u64 {
        match self {
            Scope::TenantCreation => 3,
            Scope::TenantJoining => 10,
            Scope::InvitationAcceptance => 10,
            Scope::InvitationByTenant => 100,
            Scope::InvitationByAdmin => 20,
            Scope::InvitationByIp => 10,
            Scope::InvitationByEmail => 3,
        }
    }

    /// The built-in configuration for this scope.
    pub fn default_config(&self) -> RateLimitConfig {
        RateLimitConfig::builtin(
            self.default_window_ms(),
            self.default_max_requests(),
            self.key_prefix(),
        )
    }

    /// Derive this scope's key for `identifier` under `config`'s prefix.
    ///
    /// Emails are lower-cased and IP literals canonicalised; anything else is
    /// used verbatim.
    pub fn key(&self, config: &RateLimitConfig, identifier: &str) -> RateLimitKey {
        match self {
            Scope::InvitationByEmail => RateLimitKey::for_email(config.key_prefix(), identifier),
            Scope::InvitationByIp => match identifier.parse::<IpAddr>() {
                Ok(ip) => RateLimitKey::for_ip(config.key_prefix(), ip),
                Err(_) => RateLimitKey::new(config.key_prefix(), identifier),
            },
            _ => RateLimitKey::new(config.key_prefix(), identifier),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scope {
    type Err = BulwarkError;

    fn from_str(s: &str) -> Result<Self> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.name() == s)
            .ok_or_else(|| BulwarkError::Config(format!("unknown scope: {}", s)))
    }
}

/// Named settings lookup used to override scope limits.
pub trait SettingsSource {
    /// Raw value for `name` (e.g. `TENANT_CREATION_RATE_LIMIT_WINDOW_MS`), if set.
    fn lookup(&self, name: &str) -> Option<String>;
}

impl SettingsSource for config::Config {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get_string(&name.to_lowercase())
            .or_else(|_| self.get_string(name))
            .ok()
    }
}

impl SettingsSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Resolved limits for every scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    limits: HashMap<Scope, RateLimitConfig>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limits: Scope::ALL
                .into_iter()
                .map(|scope| (scope, scope.default_config()))
                .collect(),
        }
    }
}

impl RateLimitPolicy {
    /// Policy using only built-in defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every scope from `settings`, falling back to defaults.
    pub fn from_settings(settings: &dyn SettingsSource) -> Self {
        let limits = Scope::ALL
            .into_iter()
            .map(|scope| (scope, resolve_scope(settings, scope)))
            .collect();
        Self { limits }
    }

    /// Replace one scope's limits, keeping its key prefix.
    pub fn with_limit(mut self, scope: Scope, window_ms: u64, max_requests: u64) -> Result<Self> {
        let config = RateLimitConfig::new(window_ms, max_requests, scope.key_prefix())?;
        self.limits.insert(scope, config);
        Ok(self)
    }

    /// The configuration for `scope`.
    pub fn config(&self, scope: Scope) -> &RateLimitConfig {
        &self.limits[&scope]
    }

    /// Scopes and their configurations in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (Scope, &RateLimitConfig)> {
        Scope::ALL.into_iter().map(move |scope| (scope, self.config(scope)))
    }
}

fn resolve_scope(settings: &dyn SettingsSource, scope: Scope) -> RateLimitConfig {
    let stem = scope.settings_stem();
    let window_ms = read_bounded(
        settings,
        &format!("{}_RATE_LIMIT_WINDOW_MS", stem),
        MAX_WINDOW_MS,
    )
    .unwrap_or_else(|| scope.default_window_ms());
    let max_requests = read_bounded(
        settings,
        &format!("{}_RATE_LIMIT_MAX_REQUESTS", stem),
        u64::MAX,
    )
    .unwrap_or_else(|| scope.default_max_requests());

    debug!(
        scope = %scope,
        window_ms = window_ms,
        max_requests = max_requests,
        "Resolved rate limit"
    );

    RateLimitConfig::new(window_ms, max_requests, scope.key_prefix())
        .unwrap_or_else(|_| scope.default_config())
}

/// A positive setting no larger than `max`, or `None` to fall back.
fn read_bounded(settings: &dyn SettingsSource, name: &str, max: u64) -> Option<u64> {
    let raw = settings.lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            warn!(setting = %name, "Rate limit setting must be positive, using default");
            None
        }
        Ok(value) if value > max => {
            warn!(
                setting = %name,
                value = value,
                max = max,
                "Rate limit setting too large, using default"
            );
            None
        }
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                setting = %name,
                value = %raw,
                error = %e,
                "Unparseable rate limit setting, using default"
            );
            None
        }
    }
}
