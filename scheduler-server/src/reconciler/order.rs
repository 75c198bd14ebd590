//! Watch-driven order status recompute

use super::{Outcome, Reconcile};
use crate::informer::WorkQueue;
use crate::lock::{CacheStore, Lock, order_lock_key};
use crate::matcher::Matcher;
use async_trait::async_trait;
use shared::AppResult;
use std::sync::Arc;
use std::time::Duration;

/// Re-runs the status aggregation of every changed, non-terminal order
///
/// Runs under the order's single-key lock so two replicas never write the
/// same order concurrently. A held lock requeues the id. Orders found
/// terminal nudge their ticket so its stage is rolled up; orders that just
/// became matchable hand their produced batches back to the matcher workers.
pub struct OrderReconciler {
    matcher: Arc<Matcher>,
    cache: Arc<dyn CacheStore>,
    lock_ttl: Duration,
    tickets: Option<WorkQueue<u64>>,
    generates: Option<WorkQueue<u64>>,
}

impl OrderReconciler {
    pub fn new(matcher: Arc<Matcher>, cache: Arc<dyn CacheStore>, lock_ttl: Duration) -> Self {
        Self {
            matcher,
            cache,
            lock_ttl,
            tickets: None,
            generates: None,
        }
    }

    /// Queue fed with the ticket id of every terminal order
    pub fn with_ticket_queue(mut self, tickets: WorkQueue<u64>) -> Self {
        self.tickets = Some(tickets);
        self
    }

    /// Queue fed with match-ready generate ids of orders that became matchable
    pub fn with_generate_queue(mut self, generates: WorkQueue<u64>) -> Self {
        self.generates = Some(generates);
        self
    }

    fn nudge_ticket(&self, order_id: u64) {
        if let Some(tickets) = &self.tickets {
            tickets.add(order_id);
        }
    }

    /// Re-queue batches a worker deferred while the order was not matchable
    async fn requeue_ready_batches(&self, sub_order_id: &str) -> AppResult<()> {
        let Some(generates) = &self.generates else {
            return Ok(());
        };
        let records = self
            .matcher
            .deps()
            .store
            .find_generate_records_by_order(sub_order_id)
            .await?;
        for record in records.iter().filter(|r| r.is_match_ready()) {
            tracing::debug!(sub_order_id = %sub_order_id, generate_id = record.generate_id, "Re-queueing produced batch");
            generates.add(record.generate_id);
        }
        Ok(())
    }

    async fn reconcile_locked(&self, sub_order_id: &str) -> AppResult<Outcome> {
        let order = match self.matcher.deps().store.get_apply_order(sub_order_id).await {
            Ok(order) => order,
            Err(e) if e.is_not_found() => {
                tracing::warn!(sub_order_id = %sub_order_id, "Apply order not found, skipping");
                return Ok(Outcome::Done);
            }
            Err(e) => return Err(e),
        };
        if order.status.is_terminal() {
            self.nudge_ticket(order.order_id);
            return Ok(Outcome::Done);
        }

        let outcome = self.matcher.update_apply_order_status(sub_order_id).await?;
        if outcome.became_done()
            && let Err(e) = self.matcher.notify_ticket_done(order.order_id).await
        {
            tracing::warn!(order_id = order.order_id, error = %e, "Done notification failed");
        }
        if outcome.progress.status.is_terminal() {
            self.nudge_ticket(order.order_id);
        }
        // Only on the transition: a batch already being matched is not queued twice
        if outcome.changed
            && !order.status.is_match_eligible()
            && outcome.progress.status.is_match_eligible()
        {
            self.requeue_ready_batches(sub_order_id).await?;
        }
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Reconcile<String> for OrderReconciler {
    fn name(&self) -> &'static str {
        "apply_order"
    }

    async fn reconcile(&self, sub_order_id: &String) -> AppResult<Outcome> {
        let mut lock = Lock::new(self.cache.clone(), order_lock_key(sub_order_id));
        if !lock.lock(self.lock_ttl).await? {
            return Ok(Outcome::Requeue);
        }

        let result = self.reconcile_locked(sub_order_id).await;
        if let Err(e) = lock.unlock().await {
            tracing::warn!(key = %lock.key(), error = %e, "Failed to release order lock");
        }
        result
    }
}
