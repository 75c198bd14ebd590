//! Reconcilers: consumers of the order, ticket and notice informers
//!
//! Each reconciler takes one queued id, brings the stored state in line with
//! what the record's dependents say, and reports whether the id needs another
//! pass. [`run_reconciler`] is the shared worker loop.

mod notice;
mod order;
mod ticket;

pub use notice::NoticeReconciler;
pub use order::OrderReconciler;
pub use ticket::TicketReconciler;

use crate::informer::{InformerKey, WorkQueue};
use async_trait::async_trait;
use shared::AppResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of one reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Try again later with backoff (lock contention, remote rejection)
    Requeue,
}

#[async_trait]
pub trait Reconcile<K>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &K) -> AppResult<Outcome>;
}

/// Worker loop; returns when the queue shuts down or on cancellation
///
/// Requeued ids and transient errors go back through the queue's rate
/// limiter. Other errors are logged and the id is dropped until the next
/// change event brings it back.
pub async fn run_reconciler<K: InformerKey>(
    reconciler: Arc<dyn Reconcile<K>>,
    queue: WorkQueue<K>,
    shutdown: CancellationToken,
) {
    let name = reconciler.name();
    tracing::debug!(reconciler = name, "Reconciler started");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            key = queue.get() => key,
        };
        let Some(key) = next else {
            break;
        };

        match reconciler.reconcile(&key).await {
            Ok(Outcome::Done) => queue.forget(&key),
            Ok(Outcome::Requeue) => {
                tracing::debug!(
                    reconciler = name,
                    key = %key,
                    requeues = queue.num_requeues(&key),
                    "Requeued"
                );
                queue.add_rate_limited(key.clone());
            }
            Err(e) if e.category().is_transient() => {
                tracing::warn!(reconciler = name, key = %key, code = %e.code, error = %e, "Reconcile failed, retrying");
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                tracing::error!(reconciler = name, key = %key, code = %e.code, error = %e, "Reconcile failed");
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }
    tracing::debug!(reconciler = name, "Reconciler stopped");
}
