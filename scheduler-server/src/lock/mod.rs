//! Distributed coordination locks
//!
//! Short-lived mutual exclusion across scheduler instances, backed by a shared
//! key-value cache. The key's existence is the lock; its value is a random
//! token that is never read back.
//!
//! - [`Lock`]: one key, one acquisition per instance
//! - [`MultiLock`]: all-or-nothing over several keys, with rollback of partial wins
//!
//! Unlock is an unconditional delete, so a lock held past its expiry can be
//! released by whoever holds the instance. This is a weak lock, not
//! linearizable mutual exclusion.

mod memory;
mod multi;
mod single;

pub use memory::MemoryCache;
pub use multi::MultiLock;
pub use single::Lock;

use async_trait::async_trait;
use shared::AppResult;
use std::time::Duration;

/// Reply of one pipelined cache command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Integer reply (`1` = applied, `0` = not applied)
    Int(i64),
    /// The command itself failed
    Error(String),
}

impl CommandReply {
    pub fn is_one(&self) -> bool {
        matches!(self, CommandReply::Int(1))
    }
}

/// Shared cache contract used by the locks
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Atomic set-if-absent with expiry, returns whether the key was set
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// Pipelined `SETNX key value` + `EXPIRE key ttl` for every entry
    ///
    /// Replies are positional: index `2i` is the set-if-absent reply of entry
    /// `i`, index `2i + 1` its expire reply. Each pair runs in order but the
    /// batch as a whole is not atomic.
    async fn set_nx_expire_batch(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> AppResult<Vec<CommandReply>>;

    /// Delete keys, returns how many existed
    async fn del(&self, keys: &[String]) -> AppResult<u64>;

    async fn exists(&self, key: &str) -> AppResult<bool>;
}

/// Lock key guarding one apply order
pub fn order_lock_key(sub_order_id: &str) -> String {
    format!("apply_order:{}", sub_order_id)
}

/// Fresh opaque lock value
pub(crate) fn new_lock_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
