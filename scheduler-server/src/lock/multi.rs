//! Multi-key lock
//!
//! The cache has no atomic multi-key set-if-absent, so each attempt pipelines
//! `SETNX` + `EXPIRE` for every key and classifies the replies. An attempt
//! that wins some keys but loses others rolls the winners back before the
//! next attempt; winners are never carried over.

use super::{CacheStore, CommandReply, new_lock_token};
use shared::{AppError, AppResult};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Pause between failed attempts
const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// All-or-nothing lock over a set of keys
pub struct MultiLock {
    cache: Arc<dyn CacheStore>,
    correlation_id: String,
    backoff: Duration,
    used: bool,
    /// Keys won by the successful attempt
    held: BTreeSet<String>,
    /// Keys whose rollback failed; cleared by `unlock`
    leaked: BTreeSet<String>,
}

/// Outcome of one pipelined attempt
#[derive(Debug, Default)]
struct AttemptOutcome {
    won: Vec<String>,
    lost: Vec<String>,
}

impl AttemptOutcome {
    /// Classify positional replies: set-if-absent at `2i`, expire at `2i + 1`
    ///
    /// A key counts as won only if both commands applied. A key whose expire
    /// failed after a successful set is still ours to roll back, so it is
    /// won but forces the attempt to fail.
    fn classify(keys: &[String], replies: &[CommandReply]) -> (Self, bool) {
        let mut outcome = AttemptOutcome::default();
        let mut expire_failed = false;
        for (i, key) in keys.iter().enumerate() {
            let set = replies.get(2 * i);
            let expire = replies.get(2 * i + 1);
            match set {
                Some(reply) if reply.is_one() => {
                    outcome.won.push(key.clone());
                    if !expire.is_some_and(CommandReply::is_one) {
                        expire_failed = true;
                    }
                }
                _ => outcome.lost.push(key.clone()),
            }
        }
        (outcome, expire_failed)
    }

    fn is_complete(&self) -> bool {
        self.lost.is_empty()
    }
}

impl MultiLock {
    pub fn new(cache: Arc<dyn CacheStore>, correlation_id: impl Into<String>) -> Self {
        Self {
            cache,
            correlation_id: correlation_id.into(),
            backoff: DEFAULT_BACKOFF,
            used: false,
            held: BTreeSet::new(),
            leaked: BTreeSet::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Keys `unlock` will delete
    pub fn pending_release(&self) -> Vec<String> {
        self.held.union(&self.leaked).cloned().collect()
    }

    /// Acquire every key or none, trying up to `retries` times
    ///
    /// Exhausting the attempts releases whatever needs cleanup and returns a
    /// lock-failed error.
    pub async fn lock(&mut self, retries: u32, ttl: Duration, keys: &[String]) -> AppResult<bool> {
        if self.used {
            return Err(AppError::repeat_lock().with_detail("correlation_id", self.correlation_id.clone()));
        }
        self.used = true;

        let keys: Vec<String> = keys
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if keys.is_empty() {
            return Ok(true);
        }

        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            let token = new_lock_token();
            let entries: Vec<(String, String)> =
                keys.iter().map(|k| (k.clone(), token.clone())).collect();

            match self.cache.set_nx_expire_batch(&entries, ttl).await {
                Ok(replies) => {
                    let (outcome, expire_failed) = AttemptOutcome::classify(&keys, &replies);
                    if outcome.is_complete() && !expire_failed {
                        self.held.extend(outcome.won);
                        tracing::debug!(
                            correlation_id = %self.correlation_id,
                            keys = keys.len(),
                            attempt,
                            "Multi-key lock acquired"
                        );
                        return Ok(true);
                    }
                    tracing::debug!(
                        correlation_id = %self.correlation_id,
                        attempt,
                        won = outcome.won.len(),
                        lost = ?outcome.lost,
                        expire_failed,
                        "Multi-key lock attempt failed, rolling back"
                    );
                    self.rollback(outcome.won).await;
                }
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %self.correlation_id,
                        attempt,
                        error = %e,
                        "Multi-key lock pipeline failed"
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }

        if let Err(e) = self.unlock().await {
            tracing::warn!(correlation_id = %self.correlation_id, error = %e, "Failed to release keys after lock failure");
        }
        Err(AppError::lock_failed(format!(
            "could not lock {} keys after {} attempts",
            keys.len(),
            attempts
        ))
        .with_detail("correlation_id", self.correlation_id.clone()))
    }

    async fn rollback(&mut self, won: Vec<String>) {
        if won.is_empty() {
            return;
        }
        if let Err(e) = self.cache.del(&won).await {
            tracing::warn!(
                correlation_id = %self.correlation_id,
                keys = ?won,
                error = %e,
                "Rollback failed, keys will be released on unlock"
            );
            self.leaked.extend(won);
        }
    }

    /// Delete every held or leaked key in one batch
    pub async fn unlock(&mut self) -> AppResult<()> {
        let keys = self.pending_release();
        if keys.is_empty() {
            return Ok(());
        }
        self.cache.del(&keys).await?;
        self.held.clear();
        self.leaked.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryCache;
    use async_trait::async_trait;
    use shared::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Memory cache whose first `fail_dels` deletes error out
    struct FlakyCache {
        inner: MemoryCache,
        fail_dels: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for FlakyCache {
        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
            self.inner.set_nx(key, value, ttl).await
        }

        async fn set_nx_expire_batch(
            &self,
            entries: &[(String, String)],
            ttl: Duration,
        ) -> AppResult<Vec<CommandReply>> {
            self.inner.set_nx_expire_batch(entries, ttl).await
        }

        async fn del(&self, keys: &[String]) -> AppResult<u64> {
            let remaining = self.fail_dels.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_dels.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::internal("cache unavailable"));
            }
            self.inner.del(keys).await
        }

        async fn exists(&self, key: &str) -> AppResult<bool> {
            self.inner.exists(key).await
        }
    }

    #[tokio::test]
    async fn test_acquires_all_keys() {
        let cache = Arc::new(MemoryCache::new());
        let mut lock = MultiLock::new(cache.clone(), "ticket-1");
        let ok = lock
            .lock(3, Duration::from_secs(5), &keys(&["a", "b", "c"]))
            .await
            .unwrap();
        assert!(ok);
        for k in ["a", "b", "c"] {
            assert!(cache.exists(k).await.unwrap());
        }

        lock.unlock().await.unwrap();
        for k in ["a", "b", "c"] {
            assert!(!cache.exists(k).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_partial_win_is_rolled_back() {
        let cache = Arc::new(MemoryCache::new());
        cache.set_nx("b", "external", Duration::from_secs(30)).await.unwrap();

        let mut lock =
            MultiLock::new(cache.clone(), "ticket-2").with_backoff(Duration::from_millis(1));
        let err = lock
            .lock(3, Duration::from_secs(5), &keys(&["a", "b", "c"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LockFailed);

        assert!(!cache.exists("a").await.unwrap());
        assert!(!cache.exists("c").await.unwrap());
        // The external holder keeps its key
        assert_eq!(cache.get("b").as_deref(), Some("external"));
        assert!(lock.pending_release().is_empty());
    }

    #[tokio::test]
    async fn test_succeeds_once_contention_clears() {
        let cache = Arc::new(MemoryCache::new());
        cache.set_nx("b", "external", Duration::from_secs(30)).await.unwrap();
        let releaser = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.del(&["b".to_string()]).await.unwrap();
        });

        let mut lock =
            MultiLock::new(cache.clone(), "ticket-3").with_backoff(Duration::from_millis(20));
        let ok = lock
            .lock(10, Duration::from_secs(5), &keys(&["a", "b"]))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(lock.pending_release(), keys(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_failed_rollback_is_released_on_unlock() {
        let flaky = Arc::new(FlakyCache {
            inner: MemoryCache::new(),
            fail_dels: AtomicUsize::new(1),
        });
        flaky
            .inner
            .set_nx("b", "external", Duration::from_secs(30))
            .await
            .unwrap();

        let mut lock = MultiLock::new(flaky.clone(), "ticket-4").with_backoff(Duration::from_millis(1));
        let err = lock
            .lock(1, Duration::from_secs(5), &keys(&["a", "b"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LockFailed);

        // First delete (rollback) failed, the final unlock cleared the leak
        assert!(!flaky.exists("a").await.unwrap());
        assert!(flaky.exists("b").await.unwrap());
        assert!(lock.pending_release().is_empty());
    }

    #[tokio::test]
    async fn test_reuse_is_rejected() {
        let cache = Arc::new(MemoryCache::new());
        let mut lock = MultiLock::new(cache.clone(), "ticket-5");
        assert!(lock.lock(1, Duration::from_secs(5), &keys(&["a"])).await.unwrap());
        let err = lock
            .lock(1, Duration::from_secs(5), &keys(&["z"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RepeatLock);
        assert!(!cache.exists("z").await.unwrap());
    }

    #[test]
    fn test_classify_treats_failed_expire_as_won_but_incomplete() {
        let replies = vec![
            CommandReply::Int(1),
            CommandReply::Error("timeout".into()),
            CommandReply::Int(0),
            CommandReply::Int(1),
        ];
        let (outcome, expire_failed) = AttemptOutcome::classify(&keys(&["a", "b"]), &replies);
        assert_eq!(outcome.won, keys(&["a"]));
        assert_eq!(outcome.lost, keys(&["b"]));
        assert!(expire_failed);
    }
}
