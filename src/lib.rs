//! Bulwark - Distributed Sliding Window Rate Limiting
//!
//! This crate protects sensitive multi-tenant operations (invitations, tenant
//! creation and joining) with independent quotas per tenant, user, IP and
//! email. Counters live in a store shared by every application process;
//! when that store is unreachable the limiter fails open.

pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;
pub mod store;
