//! Resume-token bookkeeping
//!
//! One document per watched collection, keyed by a fixed `_id`. Writers only
//! ever merge the fields they changed, so other bookkeeping kept in the same
//! document survives.

use crate::store::{ChangeFeed, WatchStart};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::AppResult;

/// Persisted watch position of one collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeTokenRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Wall-clock position of the last applied event
    #[serde(default)]
    pub cursor: Option<i64>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
    /// Unrelated per-collection bookkeeping
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Fields to merge into a [`ResumeTokenRecord`]; `None` leaves the stored value alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPatch {
    pub token: Option<String>,
    pub cursor: Option<i64>,
    pub event_id: Option<String>,
}

impl ResumeTokenRecord {
    /// Apply a patch, returns whether anything changed
    pub fn merge(&mut self, patch: &TokenPatch) -> bool {
        let mut changed = false;
        if let Some(token) = &patch.token
            && self.token.as_ref() != Some(token)
        {
            self.token = Some(token.clone());
            changed = true;
        }
        if let Some(cursor) = patch.cursor
            && self.cursor != Some(cursor)
        {
            self.cursor = Some(cursor);
            changed = true;
        }
        if let Some(event_id) = &patch.event_id
            && self.event_id.as_ref() != Some(event_id)
        {
            self.event_id = Some(event_id.clone());
            changed = true;
        }
        changed
    }
}

#[async_trait]
pub trait ResumeTokenStore: Send + Sync {
    async fn get_token(&self, key: &str) -> AppResult<Option<ResumeTokenRecord>>;

    /// Merge a patch into the record stored under `key`, creating it if needed
    async fn merge_token(&self, key: &str, patch: &TokenPatch) -> AppResult<()>;
}

/// Resolve where a watch on `collection` should start
///
/// Persisted token first; if there is none (or the lookup fails) the newest
/// change of the collection; an empty collection watches from now.
pub async fn get_start_watch_token(
    tokens: &dyn ResumeTokenStore,
    feed: &dyn ChangeFeed,
    token_key: &str,
    collection: &str,
) -> AppResult<WatchStart> {
    match tokens.get_token(token_key).await {
        Ok(Some(record)) => {
            if let Some(token) = record.token {
                return Ok(WatchStart::Token(token));
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(collection = %collection, error = %e, "Failed to load resume token, falling back to latest change");
        }
    }

    match feed.latest_token(collection).await? {
        Some(token) => Ok(WatchStart::Token(token)),
        None => Ok(WatchStart::Now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RedbStore;
    use shared::models::Notice;
    use crate::store::Store;

    #[test]
    fn test_merge_only_changed_fields() {
        let mut record = ResumeTokenRecord {
            id: "notice".into(),
            token: Some("00000000000000000001".into()),
            cursor: Some(10),
            event_id: Some("e1".into()),
            updated_at: 0,
            extra: Map::new(),
        };
        record.extra.insert("owner".into(), Value::from("ops"));

        let changed = record.merge(&TokenPatch {
            token: Some("00000000000000000002".into()),
            cursor: None,
            event_id: None,
        });
        assert!(changed);
        assert_eq!(record.token.as_deref(), Some("00000000000000000002"));
        assert_eq!(record.cursor, Some(10));
        assert_eq!(record.event_id.as_deref(), Some("e1"));
        assert_eq!(record.extra.get("owner"), Some(&Value::from("ops")));

        assert!(!record.merge(&TokenPatch {
            token: Some("00000000000000000002".into()),
            ..Default::default()
        }));
    }

    #[test]
    fn test_extra_fields_roundtrip() {
        let json = r#"{"_id":"apply_order","token":"7","owner":"ops"}"#;
        let record: ResumeTokenRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "apply_order");
        assert_eq!(record.extra.get("owner"), Some(&Value::from("ops")));
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["owner"], Value::from("ops"));
        assert_eq!(back["_id"], Value::from("apply_order"));
    }

    #[tokio::test]
    async fn test_start_token_prefers_persisted() {
        let store = RedbStore::open_in_memory().unwrap();
        store.upsert_notice(&Notice::new(1, "alice", "hi")).await.unwrap();
        store
            .merge_token(
                "notice",
                &TokenPatch {
                    token: Some("T".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let start = get_start_watch_token(&store, &store, "notice", "notice").await.unwrap();
        assert_eq!(start, WatchStart::Token("T".into()));
    }

    #[tokio::test]
    async fn test_start_token_falls_back_to_latest_change() {
        let store = RedbStore::open_in_memory().unwrap();
        store.upsert_notice(&Notice::new(1, "alice", "hi")).await.unwrap();
        store.upsert_notice(&Notice::new(2, "bob", "hi")).await.unwrap();
        let latest = store.latest_token("notice").await.unwrap().unwrap();

        let start = get_start_watch_token(&store, &store, "notice", "notice").await.unwrap();
        assert_eq!(start, WatchStart::Token(latest));
    }

    #[tokio::test]
    async fn test_start_token_empty_collection_watches_from_now() {
        let store = RedbStore::open_in_memory().unwrap();
        let start = get_start_watch_token(&store, &store, "notice", "notice").await.unwrap();
        assert_eq!(start, WatchStart::Now);
    }
}
