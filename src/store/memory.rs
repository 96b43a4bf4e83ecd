//! In-process store backed by a concurrent map.
//!
//! Counters held here are only shared between tasks of one process. It mirrors
//! the Redis semantics closely enough to stand in for it in tests and
//! single-node deployments: each operation is atomic for its key, batches are
//! not, empty sets vanish and TTLs are honoured lazily. Keys nobody touches
//! again are reclaimed by a periodic sweep.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{RateLimitStore, StoreResult};
use crate::ratelimit::RateLimitKey;

/// Entries of a single key, ordered by score then id.
#[derive(Debug, Default)]
struct KeySet {
    entries: BTreeSet<(i64, String)>,
    expires_at: Option<Instant>,
}

impl KeySet {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// TTL updates between two sweeps of expired keys.
pub const DEFAULT_SWEEP_INTERVAL: u64 = 1024;

/// Rate limit store living in process memory.
#[derive(Debug)]
pub struct MemoryRateLimitStore {
    keys: DashMap<String, KeySet>,
    sweep_interval: u64,
    ttl_updates: AtomicU64,
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired keys after every `interval` TTL updates.
    pub fn with_sweep_interval(interval: u64) -> Self {
        Self {
            keys: DashMap::new(),
            sweep_interval: interval.max(1),
            ttl_updates: AtomicU64::new(0),
        }
    }

    /// Number of keys held, including expired ones not yet reclaimed.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Drop every key whose TTL has elapsed. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.keys.len();
        self.keys.retain(|_, set| !set.is_expired(now));
        let swept = before.saturating_sub(self.keys.len());
        if swept > 0 {
            debug!(swept = swept, "Swept expired rate limit keys");
        }
        swept
    }

    /// Drop `key` if its TTL has elapsed.
    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        if self.keys.remove_if(key, |_, set| set.is_expired(now)).is_some() {
            trace!(key = %key, "Evicted expired key");
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn purge_expired(&self, key: &RateLimitKey, older_than: i64) -> StoreResult<u64> {
        self.evict_if_expired(key.as_str());

        let Some(mut set) = self.keys.get_mut(key.as_str()) else {
            return Ok(0);
        };

        let kept = match older_than.checked_add(1) {
            Some(bound) => set.entries.split_off(&(bound, String::new())),
            None => BTreeSet::new(),
        };
        let removed = set.entries.len() as u64;
        set.entries = kept;
        let empty = set.entries.is_empty();
        drop(set);

        if empty {
            self.keys.remove_if(key.as_str(), |_, set| set.entries.is_empty());
        }
        Ok(removed)
    }

    async fn count(&self, key: &RateLimitKey) -> StoreResult<u64> {
        self.evict_if_expired(key.as_str());
        Ok(self
            .keys
            .get(key.as_str())
            .map(|set| set.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn add(&self, key: &RateLimitKey, entry_id: &str, timestamp: i64) -> StoreResult<()> {
        self.evict_if_expired(key.as_str());

        let mut set = self.keys.entry(key.as_str().to_string()).or_default();
        // Re-adding a member updates its score, as ZADD does.
        set.entries.retain(|(_, id)| id != entry_id);
        set.entries.insert((timestamp, entry_id.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &RateLimitKey, entry_id: &str) -> StoreResult<()> {
        self.evict_if_expired(key.as_str());

        if let Some(mut set) = self.keys.get_mut(key.as_str()) {
            set.entries.retain(|(_, id)| id != entry_id);
        }
        self.keys.remove_if(key.as_str(), |_, set| set.entries.is_empty());
        Ok(())
    }

    async fn expire(&self, key: &RateLimitKey, ttl_secs: u64) -> StoreResult<()> {
        self.evict_if_expired(key.as_str());

        if let Some(mut set) = self.keys.get_mut(key.as_str()) {
            set.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }

        let updates = self.ttl_updates.fetch_add(1, Ordering::Relaxed) + 1;
        if updates % self.sweep_interval == 0 {
            self.sweep_expired();
        }
        Ok(())
    }

    async fn delete(&self, key: &RateLimitKey) -> StoreResult<()> {
        self.keys.remove(key.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> RateLimitKey {
        RateLimitKey::new("rl:test", id)
    }

    #[tokio::test]
    async fn test_add_and_count() {
        let store = MemoryRateLimitStore::new();
        let k = key("a");

        store.add(&k, "1", 10).await.unwrap();
        store.add(&k, "2", 20).await.unwrap();
        assert_eq!(store.count(&k).await.unwrap(), 2);
        assert_eq!(store.count(&key("other")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_same_member_updates_score() {
        let store = MemoryRateLimitStore::new();
        let k = key("a");

        store.add(&k, "1", 10).await.unwrap();
        store.add(&k, "1", 50).await.unwrap();
        assert_eq!(store.count(&k).await.unwrap(), 1);

        // The old score no longer exists, so purging up to 10 keeps the entry.
        assert_eq!(store.purge_expired(&k, 10).await.unwrap(), 0);
        assert_eq!(store.count(&k).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_is_inclusive() {
        let store = MemoryRateLimitStore::new();
        let k = key("a");

        store.add(&k, "1", 100).await.unwrap();
        store.add(&k, "2", 200).await.unwrap();
        store.add(&k, "3", 300).await.unwrap();

        assert_eq!(store.purge_expired(&k, 200).await.unwrap(), 2);
        assert_eq!(store.count(&k).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_everything_drops_key() {
        let store = MemoryRateLimitStore::new();
        let k = key("a");

        store.add(&k, "1", 100).await.unwrap();
        assert_eq!(store.key_count(), 1);

        store.purge_expired(&k, i64::MAX).await.unwrap();
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_single_entry() {
        let store = MemoryRateLimitStore::new();
        let k = key("a");

        store.add(&k, "1", 100).await.unwrap();
        store.add(&k, "2", 100).await.unwrap();
        store.remove(&k, "1").await.unwrap();
        assert_eq!(store.count(&k).await.unwrap(), 1);

        store.remove(&k, "2").await.unwrap();
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryRateLimitStore::new();
        let k = key("a");

        store.add(&k, "1", 100).await.unwrap();
        store.delete(&k).await.unwrap();
        assert_eq!(store.count(&k).await.unwrap(), 0);

        // Deleting a missing key is fine.
        store.delete(&k).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_reads_empty() {
        let store = MemoryRateLimitStore::new();
        let k = key("a");

        store.add(&k, "1", 100).await.unwrap();
        store.expire(&k, 61).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(store.count(&k).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.count(&k).await.unwrap(), 0);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_keys_are_swept() {
        let store = MemoryRateLimitStore::with_sweep_interval(100);

        for i in 0..1000 {
            let k = key(&format!("client-{}", i));
            store.add(&k, "1", 100).await.unwrap();
            store.expire(&k, 61).await.unwrap();
        }
        assert_eq!(store.key_count(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;

        // Ninety-nine updates on one fresh key stay below the interval.
        let fresh = key("fresh");
        store.add(&fresh, "1", 100).await.unwrap();
        for _ in 0..99 {
            store.expire(&fresh, 61).await.unwrap();
        }
        assert_eq!(store.key_count(), 1001);

        store.expire(&fresh, 61).await.unwrap();
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.count(&fresh).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_live_keys() {
        let store = MemoryRateLimitStore::new();
        let short = key("short");
        let long = key("long");

        store.add(&short, "1", 100).await.unwrap();
        store.expire(&short, 10).await.unwrap();
        store.add(&long, "1", 100).await.unwrap();
        store.expire(&long, 100).await.unwrap();
        store.add(&key("no-ttl"), "1", 100).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.key_count(), 2);
        assert_eq!(store.count(&long).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_missing_key_is_noop() {
        let store = MemoryRateLimitStore::new();
        store.expire(&key("missing"), 10).await.unwrap();
        assert_eq!(store.key_count(), 0);
    }
}
