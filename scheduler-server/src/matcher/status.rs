//! Apply order status aggregation
//!
//! An order's status is a pure function of its devices and generate records.
//! [`compute_order_status`] is that function; [`Matcher::update_apply_order_status`]
//! loads the inputs, books delivered-core quota and persists the result.

use super::Matcher;
use crate::store::OrderStatusUpdate;
use shared::AppResult;
use shared::models::{
    ApplyOrder, ApplyStage, ApplyStatus, DeviceInfo, GenerateRecord, GenerateStatus, ResourceType,
    StepName, StepStatus,
};
use std::collections::BTreeMap;

/// Aggregated progress of one apply order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderProgress {
    /// Delivered devices
    pub matched_count: u32,
    /// Devices still owed
    pub pending_count: u32,
    /// Devices of suspended generate batches
    pub suspend_count: u32,
    /// Some batch is still producing or waiting for the pipeline
    pub has_matching: bool,
    pub status: ApplyStatus,
    pub stage: ApplyStage,
}

pub fn compute_order_status(
    total: u32,
    current: ApplyStatus,
    devices: &[DeviceInfo],
    records: &[GenerateRecord],
) -> OrderProgress {
    let matched_count = devices.iter().filter(|d| d.is_delivered).count() as u32;
    let pending_count = total.saturating_sub(matched_count);

    let has_matching = records.iter().any(|r| r.is_in_flight());
    let suspend_count: u32 = records
        .iter()
        .filter(|r| r.status == GenerateStatus::Suspend)
        .map(|r| r.total_num)
        .sum();

    let mut status = if suspend_count > 0 && suspend_count + matched_count >= total {
        ApplyStatus::Terminate
    } else if matched_count < total {
        if has_matching {
            ApplyStatus::Matching
        } else {
            ApplyStatus::MatchedSome
        }
    } else {
        ApplyStatus::Done
    };

    // Nothing produced yet: the order is still waiting
    if current == ApplyStatus::WaitForMatch && records.is_empty() && matched_count == 0 {
        status = ApplyStatus::WaitForMatch;
    }

    // A graceful-terminate request holds until nothing is in flight
    if current == ApplyStatus::GracefulTerminate && !status.is_terminal() {
        status = if has_matching {
            ApplyStatus::GracefulTerminate
        } else {
            ApplyStatus::Terminate
        };
    }

    OrderProgress {
        matched_count,
        pending_count,
        suspend_count,
        has_matching,
        status,
        stage: status.stage(),
    }
}

/// Result of one status recomputation
#[derive(Debug, Clone)]
pub struct StatusOutcome {
    /// Order as loaded before the update
    pub order: ApplyOrder,
    pub progress: OrderProgress,
    /// Whether anything was written
    pub changed: bool,
}

impl StatusOutcome {
    /// The order reached Done in this pass
    pub fn became_done(&self) -> bool {
        self.changed && self.order.status != ApplyStatus::Done && self.progress.status == ApplyStatus::Done
    }
}

impl Matcher {
    /// Recompute and persist an order's status from its devices and batches
    ///
    /// Nothing is written when status, stage and delivered cores are unchanged,
    /// so a watch-driven recompute does not feed itself. The write is a
    /// compare-and-set: when another writer moved the order first, `changed`
    /// is false and no quota is booked.
    pub async fn update_apply_order_status(&self, sub_order_id: &str) -> AppResult<StatusOutcome> {
        let store = &self.deps.store;
        let order = store.get_apply_order(sub_order_id).await?;
        let devices = store.find_devices_by_order(sub_order_id).await?;
        let records = store.find_generate_records_by_order(sub_order_id).await?;

        let progress = compute_order_status(order.total, order.status, &devices, &records);
        tracing::debug!(
            sub_order_id = %sub_order_id,
            total = order.total,
            matched = progress.matched_count,
            pending = progress.pending_count,
            suspended = progress.suspend_count,
            has_matching = progress.has_matching,
            status = %progress.status,
            "Computed apply order status"
        );

        if progress.suspend_count > 0 {
            self.mark_suspended(&order, &records, progress.status == ApplyStatus::Terminate)
                .await;
        }

        let delivered_core = delivered_cores(&order, &devices);

        let mut changed = progress.status != order.status
            || progress.stage != order.stage
            || delivered_core.is_some();
        if changed {
            changed = store
                .update_apply_order_status(
                    sub_order_id,
                    &OrderStatusUpdate {
                        from_status: order.status,
                        from_core: order.delivered_core,
                        status: progress.status,
                        stage: progress.stage,
                        delivered_core,
                    },
                )
                .await?;
        }
        if changed {
            tracing::info!(
                sub_order_id = %sub_order_id,
                from = %order.status,
                to = %progress.status,
                matched = progress.matched_count,
                total = order.total,
                "Apply order status updated"
            );
            if let Some(cores) = delivered_core {
                self.book_delivered_cores(&order, &devices, cores).await?;
            }
        } else if progress.status != order.status || delivered_core.is_some() {
            tracing::debug!(
                sub_order_id = %sub_order_id,
                "Apply order changed concurrently, status left to the other writer"
            );
        }

        Ok(StatusOutcome {
            order,
            progress,
            changed,
        })
    }

    /// Fail the generate step; once the order terminates, fail the suspended batches too
    async fn mark_suspended(&self, order: &ApplyOrder, records: &[GenerateRecord], terminating: bool) {
        let store = &self.deps.store;
        let already_failed = matches!(
            store.get_step(&order.sub_order_id, StepName::Generate).await,
            Ok(Some(step)) if step.status == StepStatus::Failed
        );
        if !already_failed
            && let Err(e) = store
                .update_step(
                    &order.sub_order_id,
                    StepName::Generate,
                    StepStatus::Failed,
                    "generate suspended",
                )
                .await
        {
            tracing::warn!(sub_order_id = %order.sub_order_id, error = %e, "Failed to mark generate step failed");
        }

        if !terminating {
            return;
        }
        for record in records.iter().filter(|r| r.status == GenerateStatus::Suspend) {
            if let Err(e) = store
                .update_generate_status(record.generate_id, GenerateStatus::Failed, "generate suspended")
                .await
            {
                tracing::warn!(
                    sub_order_id = %order.sub_order_id,
                    generate_id = record.generate_id,
                    error = %e,
                    "Failed to mark suspended generate record failed"
                );
            }
        }
    }

    /// Add newly delivered cores to the business' rolling counter
    async fn book_delivered_cores(
        &self,
        order: &ApplyOrder,
        devices: &[DeviceInfo],
        cores: u32,
    ) -> AppResult<()> {
        if order.resource_type == ResourceType::Cvm {
            let mut by_type: BTreeMap<&str, u32> = BTreeMap::new();
            for device in devices.iter().filter(|d| d.is_delivered) {
                *by_type.entry(device.device_type.as_str()).or_insert(0) += device.cpu_core;
            }
            for (device_type, type_cores) in by_type {
                tracing::info!(
                    sub_order_id = %order.sub_order_id,
                    biz_id = order.biz_id,
                    require_type = ?order.require_type,
                    plan_device_type = %order.spec.device_type,
                    device_type = %device_type,
                    cores = type_cores,
                    "Matched CVM demand"
                );
            }
        }

        let delta = i64::from(cores) - i64::from(order.delivered_core);
        let total = self.deps.store.add_delivered_cores(order.biz_id, delta).await?;
        tracing::info!(
            sub_order_id = %order.sub_order_id,
            biz_id = order.biz_id,
            delta,
            total,
            "Delivered cores booked"
        );
        Ok(())
    }
}

/// New delivered-core total of a quota-tracked order, `None` when unchanged
fn delivered_cores(order: &ApplyOrder, devices: &[DeviceInfo]) -> Option<u32> {
    if !order.resource_type.requires_quota() {
        return None;
    }
    let cores: u32 = devices
        .iter()
        .filter(|d| d.is_delivered)
        .map(|d| d.cpu_core)
        .sum();
    (cores != order.delivered_core).then_some(cores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::testing::{Harness, fast_options};
    use crate::store::Store;

    fn devices(delivered: u32, undelivered: u32) -> Vec<DeviceInfo> {
        (0..delivered + undelivered)
            .map(|i| {
                let mut d = DeviceInfo::new(u64::from(i) + 1, "so-1", 1, format!("10.0.0.{i}"));
                d.is_delivered = i < delivered;
                d
            })
            .collect()
    }

    fn record(id: u64, status: GenerateStatus, total_num: u32, is_matched: bool) -> GenerateRecord {
        let mut r = GenerateRecord::new(id, "so-1", total_num);
        r.status = status;
        r.is_matched = is_matched;
        r
    }

    #[test]
    fn test_handling_record_keeps_order_matching() {
        let progress = compute_order_status(
            3,
            ApplyStatus::Matching,
            &devices(2, 0),
            &[
                record(1, GenerateStatus::Success, 2, true),
                record(2, GenerateStatus::Handling, 1, false),
            ],
        );
        assert_eq!(progress.status, ApplyStatus::Matching);
        assert_eq!(progress.stage, ApplyStage::Running);
        assert_eq!(progress.matched_count, 2);
        assert_eq!(progress.pending_count, 1);
        assert!(progress.has_matching);
    }

    #[test]
    fn test_suspended_batch_terminates_order() {
        let progress = compute_order_status(
            2,
            ApplyStatus::Matching,
            &devices(1, 0),
            &[
                record(1, GenerateStatus::Success, 1, true),
                record(2, GenerateStatus::Suspend, 1, false),
            ],
        );
        assert_eq!(progress.suspend_count, 1);
        assert_eq!(progress.status, ApplyStatus::Terminate);
        assert_eq!(progress.stage, ApplyStage::Terminate);
    }

    #[test]
    fn test_terminate_wins_over_in_flight_batches() {
        let progress = compute_order_status(
            2,
            ApplyStatus::Matching,
            &devices(0, 0),
            &[
                record(1, GenerateStatus::Suspend, 2, false),
                record(2, GenerateStatus::Handling, 1, false),
            ],
        );
        assert!(progress.has_matching);
        assert_eq!(progress.status, ApplyStatus::Terminate);
    }

    #[test]
    fn test_matched_some_and_done() {
        let idle = [record(1, GenerateStatus::Success, 2, true)];
        let some = compute_order_status(3, ApplyStatus::Matching, &devices(2, 1), &idle);
        assert_eq!(some.status, ApplyStatus::MatchedSome);
        assert_eq!(some.matched_count, 2);

        let done = compute_order_status(2, ApplyStatus::Matching, &devices(2, 0), &idle);
        assert_eq!(done.status, ApplyStatus::Done);
        assert_eq!(done.stage, ApplyStage::Done);
        assert_eq!(done.pending_count, 0);
    }

    #[test]
    fn test_matched_count_equals_delivered_devices() {
        for delivered in 0..5 {
            for undelivered in 0..3 {
                let progress =
                    compute_order_status(4, ApplyStatus::Matching, &devices(delivered, undelivered), &[]);
                assert_eq!(progress.matched_count, delivered);
            }
        }
    }

    #[test]
    fn test_unproduced_order_keeps_waiting() {
        let waiting = compute_order_status(2, ApplyStatus::WaitForMatch, &[], &[]);
        assert_eq!(waiting.status, ApplyStatus::WaitForMatch);
        assert_eq!(waiting.pending_count, 2);

        let produced = [record(1, GenerateStatus::Init, 2, false)];
        let matching = compute_order_status(2, ApplyStatus::WaitForMatch, &[], &produced);
        assert_eq!(matching.status, ApplyStatus::Matching);
    }

    #[test]
    fn test_graceful_terminate() {
        let in_flight = [record(1, GenerateStatus::Handling, 2, false)];
        let held = compute_order_status(2, ApplyStatus::GracefulTerminate, &devices(0, 0), &in_flight);
        assert_eq!(held.status, ApplyStatus::GracefulTerminate);

        let idle = [record(1, GenerateStatus::Success, 2, true)];
        let ended = compute_order_status(3, ApplyStatus::GracefulTerminate, &devices(1, 0), &idle);
        assert_eq!(ended.status, ApplyStatus::Terminate);

        let done = compute_order_status(1, ApplyStatus::GracefulTerminate, &devices(1, 0), &idle);
        assert_eq!(done.status, ApplyStatus::Done);
    }

    #[tokio::test]
    async fn test_update_books_quota_and_skips_noop_writes() {
        let h = Harness::new(fast_options()).unwrap();
        let mut order = ApplyOrder::new("so-1", 9, 300, "alice", 2, ResourceType::Cvm);
        order.status = ApplyStatus::Matching;
        h.store.upsert_apply_order(&order).await.unwrap();
        h.store
            .upsert_generate_record(&record(1, GenerateStatus::Success, 2, true))
            .await
            .unwrap();
        for (id, cores) in [(1u64, 8u32), (2, 16)] {
            let mut d = DeviceInfo::new(id, "so-1", 1, format!("10.0.1.{id}"));
            d.cpu_core = cores;
            d.device_type = "S5.2XLARGE16".into();
            d.is_delivered = true;
            h.store.upsert_device(&d).await.unwrap();
        }

        let outcome = h.matcher.update_apply_order_status("so-1").await.unwrap();
        assert!(outcome.changed);
        assert!(outcome.became_done());
        let stored = h.store.get_apply_order("so-1").await.unwrap();
        assert_eq!(stored.status, ApplyStatus::Done);
        assert_eq!(stored.delivered_core, 24);
        assert_eq!(h.store.add_delivered_cores(300, 0).await.unwrap(), 24);

        // Second pass has nothing new to write or book
        let again = h.matcher.update_apply_order_status("so-1").await.unwrap();
        assert!(!again.changed);
        assert_eq!(h.store.add_delivered_cores(300, 0).await.unwrap(), 24);
    }

    #[tokio::test]
    async fn test_terminate_fails_suspended_records_and_step() {
        let h = Harness::new(fast_options()).unwrap();
        let mut order = ApplyOrder::new("so-1", 9, 300, "alice", 1, ResourceType::IdcDvm);
        order.status = ApplyStatus::Matching;
        h.store.upsert_apply_order(&order).await.unwrap();
        h.store
            .upsert_generate_record(&record(5, GenerateStatus::Suspend, 1, false))
            .await
            .unwrap();

        let outcome = h.matcher.update_apply_order_status("so-1").await.unwrap();
        assert_eq!(outcome.progress.status, ApplyStatus::Terminate);

        let step = h.store.get_step("so-1", StepName::Generate).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        let record = h.store.get_generate_record(5).await.unwrap();
        assert_eq!(record.status, GenerateStatus::Failed);
        // Not a quota resource type
        assert_eq!(h.store.add_delivered_cores(300, 0).await.unwrap(), 0);
    }
}
