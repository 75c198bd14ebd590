//! Ticket stage roll-up

use super::{Outcome, Reconcile};
use crate::lock::{CacheStore, MultiLock, order_lock_key};
use crate::store::Store;
use async_trait::async_trait;
use shared::models::{ApplyStage, ApplyStatus, derive_ticket_stage};
use shared::{AppResult, ErrorCode};
use std::sync::Arc;
use std::time::Duration;

const LOCK_RETRIES: u32 = 3;

/// Derives a running ticket's stage from its sub-orders
///
/// All member orders are locked together so the stage is computed from a
/// consistent set of statuses.
pub struct TicketReconciler {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheStore>,
    lock_ttl: Duration,
    lock_backoff: Duration,
}

impl TicketReconciler {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn CacheStore>, lock_ttl: Duration) -> Self {
        Self {
            store,
            cache,
            lock_ttl,
            lock_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_lock_backoff(mut self, backoff: Duration) -> Self {
        self.lock_backoff = backoff;
        self
    }

    async fn roll_up(&self, order_id: u64, current: ApplyStage) -> AppResult<Outcome> {
        let orders = self.store.find_apply_orders_by_ticket(order_id).await?;
        let statuses: Vec<ApplyStatus> = orders.iter().map(|o| o.status).collect();
        let stage = derive_ticket_stage(&statuses);
        if stage == current {
            return Ok(Outcome::Done);
        }

        self.store.update_ticket_stage(order_id, stage).await?;
        tracing::info!(order_id, from = ?current, to = ?stage, orders = orders.len(), "Ticket stage updated");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Reconcile<u64> for TicketReconciler {
    fn name(&self) -> &'static str {
        "apply_ticket"
    }

    async fn reconcile(&self, order_id: &u64) -> AppResult<Outcome> {
        let order_id = *order_id;
        let ticket = match self.store.get_ticket(order_id).await {
            Ok(ticket) => ticket,
            Err(e) if e.is_not_found() => {
                tracing::warn!(order_id, "Ticket not found, skipping");
                return Ok(Outcome::Done);
            }
            Err(e) => return Err(e),
        };
        if ticket.stage != ApplyStage::Running {
            return Ok(Outcome::Done);
        }

        let keys: Vec<String> = self
            .store
            .find_apply_orders_by_ticket(order_id)
            .await?
            .iter()
            .map(|o| order_lock_key(&o.sub_order_id))
            .collect();

        let mut lock = MultiLock::new(self.cache.clone(), format!("ticket:{order_id}"))
            .with_backoff(self.lock_backoff);
        match lock.lock(LOCK_RETRIES, self.lock_ttl, &keys).await {
            Ok(_) => {}
            Err(e) if e.code == ErrorCode::LockFailed => {
                tracing::debug!(order_id, keys = keys.len(), "Ticket orders busy, requeue");
                return Ok(Outcome::Requeue);
            }
            Err(e) => return Err(e),
        }

        let result = self.roll_up(order_id, ticket.stage).await;
        if let Err(e) = lock.unlock().await {
            tracing::warn!(order_id, error = %e, "Failed to release ticket order locks");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{Lock, MemoryCache};
    use crate::store::RedbStore;
    use shared::models::{ApplyOrder, ApplyTicket, ResourceType};

    async fn setup(statuses: &[ApplyStatus]) -> (Arc<RedbStore>, Arc<MemoryCache>, TicketReconciler) {
        let store = Arc::new(RedbStore::open_in_memory().unwrap());
        store.upsert_ticket(&ApplyTicket::new(9, 300, "alice")).await.unwrap();
        for (i, status) in statuses.iter().enumerate() {
            let mut order = ApplyOrder::new(format!("so-{i}"), 9, 300, "alice", 1, ResourceType::Cvm);
            order.status = *status;
            store.upsert_apply_order(&order).await.unwrap();
        }
        let cache = Arc::new(MemoryCache::new());
        let reconciler = TicketReconciler::new(store.clone(), cache.clone(), Duration::from_secs(5))
            .with_lock_backoff(Duration::from_millis(5));
        (store, cache, reconciler)
    }

    #[tokio::test]
    async fn test_all_done_marks_ticket_done() {
        let (store, cache, reconciler) = setup(&[ApplyStatus::Done, ApplyStatus::Done]).await;
        assert_eq!(reconciler.reconcile(&9).await.unwrap(), Outcome::Done);
        assert_eq!(store.get_ticket(9).await.unwrap().stage, ApplyStage::Done);
        assert!(!cache.exists(&order_lock_key("so-0")).await.unwrap());
        assert!(!cache.exists(&order_lock_key("so-1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_mix_terminates_and_running_stays() {
        let (store, _cache, reconciler) = setup(&[ApplyStatus::Done, ApplyStatus::Terminate]).await;
        reconciler.reconcile(&9).await.unwrap();
        assert_eq!(store.get_ticket(9).await.unwrap().stage, ApplyStage::Terminate);

        let (store, _cache, reconciler) = setup(&[ApplyStatus::Done, ApplyStatus::Matching]).await;
        reconciler.reconcile(&9).await.unwrap();
        assert_eq!(store.get_ticket(9).await.unwrap().stage, ApplyStage::Running);
    }

    #[tokio::test]
    async fn test_busy_member_order_requeues_without_leaking() {
        let (store, cache, reconciler) = setup(&[ApplyStatus::Done, ApplyStatus::Done]).await;
        let mut held = Lock::new(cache.clone(), order_lock_key("so-1"));
        assert!(held.lock(Duration::from_secs(5)).await.unwrap());

        assert_eq!(reconciler.reconcile(&9).await.unwrap(), Outcome::Requeue);
        assert_eq!(store.get_ticket(9).await.unwrap().stage, ApplyStage::Running);
        assert!(!cache.exists(&order_lock_key("so-0")).await.unwrap());

        held.unlock().await.unwrap();
        assert_eq!(reconciler.reconcile(&9).await.unwrap(), Outcome::Done);
        assert_eq!(store.get_ticket(9).await.unwrap().stage, ApplyStage::Done);
    }

    #[tokio::test]
    async fn test_finished_ticket_is_left_alone() {
        let (store, _cache, reconciler) = setup(&[ApplyStatus::Matching]).await;
        store.update_ticket_stage(9, ApplyStage::Terminate).await.unwrap();
        assert_eq!(reconciler.reconcile(&9).await.unwrap(), Outcome::Done);
        assert_eq!(store.get_ticket(9).await.unwrap().stage, ApplyStage::Terminate);
        assert_eq!(reconciler.reconcile(&404).await.unwrap(), Outcome::Done);
    }
}
