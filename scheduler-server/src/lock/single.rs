//! Single-key lock

use super::{CacheStore, new_lock_token};
use shared::{AppError, AppResult};
use std::sync::Arc;
use std::time::Duration;

/// One-shot lock over a single cache key
///
/// An instance acquires at most once; build a new one per critical section.
pub struct Lock {
    cache: Arc<dyn CacheStore>,
    key: String,
    used: bool,
    acquired: bool,
}

impl Lock {
    pub fn new(cache: Arc<dyn CacheStore>, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
            used: false,
            acquired: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Try to take the key with the given expiry
    ///
    /// A second call on the same instance fails with a repeat-lock error
    /// without touching the cache.
    pub async fn lock(&mut self, ttl: Duration) -> AppResult<bool> {
        if self.used {
            return Err(AppError::repeat_lock().with_detail("key", self.key.clone()));
        }
        self.used = true;

        let acquired = self.cache.set_nx(&self.key, &new_lock_token(), ttl).await?;
        self.acquired = acquired;
        if !acquired {
            tracing::debug!(key = %self.key, "Lock is held elsewhere");
        }
        Ok(acquired)
    }

    /// Delete the key if this instance acquired it
    pub async fn unlock(&mut self) -> AppResult<()> {
        if !self.acquired {
            return Ok(());
        }
        self.cache.del(std::slice::from_ref(&self.key)).await?;
        self.acquired = false;
        Ok(())
    }
}
