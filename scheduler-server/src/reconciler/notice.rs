//! Queued user notices

use super::{Outcome, Reconcile};
use crate::clients::NotifyApi;
use crate::store::Store;
use async_trait::async_trait;
use shared::AppResult;
use std::sync::Arc;

/// Sends unsent notices; a failed send leaves the notice unsent and requeues it
pub struct NoticeReconciler {
    store: Arc<dyn Store>,
    notify: Arc<dyn NotifyApi>,
}

impl NoticeReconciler {
    pub fn new(store: Arc<dyn Store>, notify: Arc<dyn NotifyApi>) -> Self {
        Self { store, notify }
    }
}

#[async_trait]
impl Reconcile<u64> for NoticeReconciler {
    fn name(&self) -> &'static str {
        "notice"
    }

    async fn reconcile(&self, notice_id: &u64) -> AppResult<Outcome> {
        let notice_id = *notice_id;
        let notice = match self.store.get_notice(notice_id).await {
            Ok(notice) => notice,
            Err(e) if e.is_not_found() => return Ok(Outcome::Done),
            Err(e) => return Err(e),
        };
        if notice.sent {
            return Ok(Outcome::Done);
        }

        match self.notify.send(&notice.user, &notice.content).await {
            Ok(result) if result.is_ok() => {
                self.store.mark_notice_sent(notice_id).await?;
                tracing::info!(notice_id, user = %notice.user, "Notice sent");
                Ok(Outcome::Done)
            }
            Ok(result) => {
                tracing::warn!(
                    notice_id,
                    user = %notice.user,
                    code = result.code,
                    message = %result.message,
                    "Notice rejected"
                );
                Ok(Outcome::Requeue)
            }
            Err(e) => {
                tracing::warn!(notice_id, user = %notice.user, error = %e, "Notice send failed");
                Ok(Outcome::Requeue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::testing::MockNotify;
    use crate::store::RedbStore;
    use shared::models::Notice;

    async fn setup() -> (Arc<RedbStore>, Arc<MockNotify>, NoticeReconciler) {
        let store = Arc::new(RedbStore::open_in_memory().unwrap());
        store
            .upsert_notice(&Notice::new(1, "alice", "disk replaced"))
            .await
            .unwrap();
        let notify = Arc::new(MockNotify::new());
        let reconciler = NoticeReconciler::new(store.clone(), notify.clone());
        (store, notify, reconciler)
    }

    #[tokio::test]
    async fn test_sends_and_marks_sent_once() {
        let (store, notify, reconciler) = setup().await;
        assert_eq!(reconciler.reconcile(&1).await.unwrap(), Outcome::Done);
        assert!(store.get_notice(1).await.unwrap().sent);
        assert_eq!(notify.sent(), vec![("alice".to_string(), "disk replaced".to_string())]);

        // Already sent: nothing goes out again
        reconciler.reconcile(&1).await.unwrap();
        assert_eq!(notify.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_stays_unsent_and_requeues() {
        let (store, notify, reconciler) = setup().await;
        notify.fail_for("alice");
        assert_eq!(reconciler.reconcile(&1).await.unwrap(), Outcome::Requeue);
        assert!(!store.get_notice(1).await.unwrap().sent);

        notify.recover("alice");
        assert_eq!(reconciler.reconcile(&1).await.unwrap(), Outcome::Done);
        assert!(store.get_notice(1).await.unwrap().sent);
    }
}
