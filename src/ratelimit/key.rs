//! Rate limit key generation.

use std::net::IpAddr;

/// A key addressing one counter in the shared store.
///
/// The key is composed of the scope's prefix and the scope identifier,
/// joined by `:`. Distinct prefixes per scope keep counters from colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Create a key from a prefix and an opaque identifier (tenant or user id).
    pub fn new(prefix: &str, identifier: &str) -> Self {
        Self(format!("{}:{}", prefix, identifier))
    }

    /// Create a key for an IP address, using its canonical literal form.
    pub fn for_ip(prefix: &str, ip: IpAddr) -> Self {
        Self::new(prefix, &ip.to_string())
    }

    /// Create a key for an email address. Emails are matched case-insensitively.
    pub fn for_email(prefix: &str, email: &str) -> Self {
        Self::new(prefix, &email.trim().to_lowercase())
    }

    /// The full key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_joins_prefix_and_identifier() {
        let key = RateLimitKey::new("rl:invitation-tenant", "tenant-42");
        assert_eq!(key.as_str(), "rl:invitation-tenant:tenant-42");
    }

    #[test]
    fn test_email_key_is_lowercased() {
        let a = RateLimitKey::for_email("rl:invitation-email", "Alice@Example.COM");
        let b = RateLimitKey::for_email("rl:invitation-email", " alice@example.com ");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "rl:invitation-email:alice@example.com");
    }

    #[test]
    fn test_ip_key_uses_literal() {
        let v4 = RateLimitKey::for_ip("rl:invitation-ip", "10.0.0.1".parse().unwrap());
        assert_eq!(v4.as_str(), "rl:invitation-ip:10.0.0.1");

        let v6 = RateLimitKey::for_ip("rl:invitation-ip", "::1".parse().unwrap());
        assert_eq!(v6.as_str(), "rl:invitation-ip:::1");
    }

    #[test]
    fn test_same_identifier_different_prefix_differs() {
        let a = RateLimitKey::new("rl:tenant-creation", "user-1");
        let b = RateLimitKey::new("rl:tenant-joining", "user-1");
        assert_ne!(a, b);
    }
}
