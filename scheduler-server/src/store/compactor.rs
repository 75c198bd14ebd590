//! Periodic change-journal trimming
//!
//! Every write appends to the journal; entries at or below a collection's
//! persisted resume token are never replayed again and are removed here.

use super::RedbStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct JournalCompactor {
    store: Arc<RedbStore>,
    /// (collection, resume-token key) of every informer
    watched: Vec<(&'static str, &'static str)>,
    interval: Duration,
}

impl JournalCompactor {
    pub fn new(store: Arc<RedbStore>, interval: Duration) -> Self {
        Self {
            store,
            watched: Vec::new(),
            interval,
        }
    }

    /// Trim `collection` only up to the token stored under `token_key`
    pub fn watch(mut self, collection: &'static str, token_key: &'static str) -> Self {
        self.watched.push((collection, token_key));
        self
    }

    /// Compact on every tick until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "JournalCompactor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.compact_once();
                }
            }
        }
        tracing::debug!("JournalCompactor stopped");
    }

    /// One compaction pass; failures are logged and retried on the next tick
    pub fn compact_once(&self) -> usize {
        match self.store.compact_journal(&self.watched) {
            Ok(0) => 0,
            Ok(removed) => {
                tracing::info!(removed, "Compacted change journal");
                removed
            }
            Err(e) => {
                tracing::error!(error = %e, "Change journal compaction failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::{ResumeTokenStore, TokenPatch};
    use crate::store::{ChangeFeed, Store, collection};
    use shared::models::Notice;

    #[tokio::test]
    async fn test_compacts_up_to_persisted_token_until_shutdown() {
        let store = Arc::new(RedbStore::open_in_memory().unwrap());
        store.upsert_notice(&Notice::new(1, "bob", "x")).await.unwrap();
        store.upsert_notice(&Notice::new(2, "bob", "y")).await.unwrap();
        let applied = store.latest_token(collection::NOTICE).await.unwrap();
        store
            .merge_token(
                "notice",
                &TokenPatch {
                    token: applied,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.upsert_notice(&Notice::new(3, "bob", "z")).await.unwrap();

        let compactor = JournalCompactor::new(store.clone(), Duration::from_millis(10))
            .watch(collection::NOTICE, "notice");
        assert_eq!(compactor.compact_once(), 2);
        assert_eq!(compactor.compact_once(), 0);

        let token = CancellationToken::new();
        let handle = tokio::spawn(compactor.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(store.latest_token(collection::NOTICE).await.unwrap().is_some());
    }
}
