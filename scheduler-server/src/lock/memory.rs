//! In-process cache store
//!
//! `dashmap`-backed stand-in for a shared cache, with per-key expiry checked
//! lazily on access. Commands behave like their Redis counterparts: `EXPIRE`
//! on an existing key refreshes it whoever set it.

use super::{CacheStore, CommandReply};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use shared::AppResult;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn setnx(&self, key: &str, value: &str, expires_at: Option<Instant>) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return false;
                }
                occupied.insert(CacheEntry {
                    value: value.to_string(),
                    expires_at,
                });
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    value: value.to_string(),
                    expires_at,
                });
                true
            }
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = now.checked_add(ttl);
                true
            }
            _ => false,
        }
    }

    /// Current value of a live key
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        // A TTL past the clock's range never expires
        Ok(self.setnx(key, value, Instant::now().checked_add(ttl)))
    }

    async fn set_nx_expire_batch(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> AppResult<Vec<CommandReply>> {
        let mut replies = Vec::with_capacity(entries.len() * 2);
        for (key, value) in entries {
            let set = self.setnx(key, value, None);
            replies.push(CommandReply::Int(set as i64));
            let expired = self.expire(key, ttl);
            replies.push(CommandReply::Int(expired as i64));
        }
        Ok(replies)
    }

    async fn del(&self, keys: &[String]) -> AppResult<u64> {
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key)
                && !entry.is_expired(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        Ok(self.get(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_respects_existing_key() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("k", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.set_nx("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.get("k").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_key_can_be_taken() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("k", "a", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.set_nx("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.get("k").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_batch_replies_are_positional() {
        let cache = MemoryCache::new();
        cache.set_nx("b", "held", Duration::from_secs(5)).await.unwrap();

        let entries = vec![
            ("a".to_string(), "t".to_string()),
            ("b".to_string(), "t".to_string()),
        ];
        let replies = cache
            .set_nx_expire_batch(&entries, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![
                CommandReply::Int(1),
                CommandReply::Int(1),
                CommandReply::Int(0),
                CommandReply::Int(1),
            ]
        );
        assert_eq!(cache.get("b").as_deref(), Some("held"));
    }

    #[tokio::test]
    async fn test_del_counts_live_keys() {
        let cache = MemoryCache::new();
        cache.set_nx("a", "1", Duration::from_secs(5)).await.unwrap();
        cache.set_nx("b", "1", Duration::from_secs(5)).await.unwrap();
        let removed = cache
            .del(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!cache.exists("a").await.unwrap());
    }
}
