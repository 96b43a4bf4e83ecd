//! Guard composition: map an operation onto its scopes and check each in turn.
//!
//! Scopes are evaluated in a fixed order and evaluation stops at the first
//! rejection. Scopes checked before the rejecting one keep the hit they
//! recorded, even though the request as a whole is refused.

mod headers;

pub use headers::{RateLimitHeaders, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER};

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::GuardConfig;
use crate::ratelimit::{
    now_ms, RateLimitKey, RateLimitPolicy, RateLimitResult, Scope, SlidingWindowLimiter,
};

/// Operations protected by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    CreateInvitation,
    AcceptInvitation,
    CreateTenant,
    JoinTenant,
}

impl Operation {
    /// Scopes that apply to this operation, in evaluation order.
    pub fn scopes(&self) -> &'static [Scope] {
        match self {
            Operation::CreateInvitation => &[
                Scope::InvitationByTenant,
                Scope::InvitationByAdmin,
                Scope::InvitationByEmail,
            ],
            Operation::AcceptInvitation => &[Scope::InvitationByIp, Scope::InvitationAcceptance],
            Operation::CreateTenant => &[Scope::TenantCreation],
            Operation::JoinTenant => &[Scope::TenantJoining],
        }
    }
}

/// The identifiers a request carries. Absent fields switch off their scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub ip: Option<IpAddr>,
    /// Invitee email, for invitation creation
    pub email: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// The identifier `scope` is keyed on, if the request has one.
    pub fn identifier(&self, scope: Scope) -> Option<String> {
        let id = match scope {
            Scope::InvitationByTenant => self.tenant_id.clone(),
            Scope::InvitationByIp => self.ip.map(|ip| ip.to_string()),
            Scope::InvitationByEmail => self.email.clone(),
            Scope::TenantCreation
            | Scope::TenantJoining
            | Scope::InvitationAcceptance
            | Scope::InvitationByAdmin => self.user_id.clone(),
        };
        id.filter(|id| !id.trim().is_empty())
    }
}

/// One evaluated scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeOutcome {
    pub scope: Scope,
    pub key: RateLimitKey,
    pub result: RateLimitResult,
    pub headers: RateLimitHeaders,
}

/// A request that passed every applicable scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// Scopes that were evaluated, in order
    pub evaluated: Vec<ScopeOutcome>,
}

impl Admission {
    /// Headers of the last evaluated scope, if any applied.
    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        self.evaluated.last().map(|outcome| &outcome.headers)
    }
}

/// A request refused by one of its scopes. Maps to HTTP 429.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Too many requests ({scope}). Try again in {retry_after_secs} seconds.")]
pub struct RateLimitRejection {
    pub scope: Scope,
    pub result: RateLimitResult,
    pub retry_after_secs: u64,
    pub headers: RateLimitHeaders,
}

impl RateLimitRejection {
    pub const STATUS_CODE: u16 = 429;
}

/// Applies the scope policy to incoming operations.
#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    limiter: SlidingWindowLimiter,
    policy: Arc<RateLimitPolicy>,
    config: GuardConfig,
}

impl RateLimitGuard {
    pub fn new(
        limiter: SlidingWindowLimiter,
        policy: Arc<RateLimitPolicy>,
        config: GuardConfig,
    ) -> Self {
        Self {
            limiter,
            policy,
            config,
        }
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Check `operation` for the request described by `ctx` now.
    pub async fn check(
        &self,
        operation: Operation,
        ctx: &RequestContext,
    ) -> Result<Admission, RateLimitRejection> {
        self.check_at(operation, ctx, now_ms()).await
    }

    /// Check `operation` for the request described by `ctx` at `now` (epoch ms).
    #[instrument(skip(self, ctx))]
    pub async fn check_at(
        &self,
        operation: Operation,
        ctx: &RequestContext,
        now: i64,
    ) -> Result<Admission, RateLimitRejection> {
        let mut admission = Admission::default();

        for &scope in operation.scopes() {
            let Some(identifier) = ctx.identifier(scope) else {
                debug!(scope = %scope, "Scope not applicable, skipping");
                continue;
            };

            let config = self.policy.config(scope);
            let key = scope.key(config, &identifier);
            let result = self.limiter.check_and_consume_at(&key, config, now).await;
            let headers = RateLimitHeaders::new(&result, config, self.config.legacy_limit_header);

            if !result.allowed {
                let retry_after_secs = result.secs_until_reset(now);
                info!(
                    scope = %scope,
                    key = %key,
                    retry_after_secs = retry_after_secs,
                    "Request rejected by rate limit"
                );
                return Err(RateLimitRejection {
                    scope,
                    result,
                    retry_after_secs,
                    headers,
                });
            }

            admission.evaluated.push(ScopeOutcome {
                scope,
                key,
                result,
                headers,
            });
        }

        Ok(admission)
    }
}
