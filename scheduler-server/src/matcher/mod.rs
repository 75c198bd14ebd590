//! Matching pipeline
//!
//! Worker loops pop generate-record ids from the generate informer and drive
//! each produced batch through init → disk check → deliver, then recompute
//! the owning order's status.
//!
//! ```text
//! generate informer ──pop──▶ worker ──▶ match_handler
//!                                         ├─ init        (bounded fan-out)
//!                                         ├─ disk check  (unbounded fan-out, optional)
//!                                         ├─ deliver     (sequential)
//!                                         ├─ mark batch matched
//!                                         ├─ update_apply_order_status
//!                                         └─ done notification (best effort)
//! ```
//!
//! Device flags make every stage safe to re-run: a device already inited,
//! disk-checked or delivered is not touched again. A produced batch whose
//! order is not matchable yet is deferred to the order reconciler.

mod deliver;
mod disk;
mod init;
mod job;
mod notify;
pub mod pool;
pub mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use status::{OrderProgress, StatusOutcome, compute_order_status};

use crate::clients::{AutomationApi, InventoryApi, NotifyApi};
use crate::informer::{Informer, WorkQueue};
use crate::store::Store;
use shared::models::{ApplyOrder, DeviceInfo, GenerateRecord, StepName, StepStatus};
use shared::{AppError, AppResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pipeline tuning, read once at startup
#[derive(Debug, Clone)]
pub struct MatcherOptions {
    /// Worker loops popping from the generate queue
    pub workers: usize,
    /// Init jobs created at the same time
    pub init_concurrency: usize,
    pub init_job_retries: u32,
    pub init_job_retry_interval: Duration,
    pub job_poll_interval: Duration,
    /// A job not finished within this is a failure
    pub job_poll_timeout: Duration,
    /// Global switch; orders opt in through `spec.disk_check`
    pub disk_check_enabled: bool,
    pub disk_check_retries: u32,
    pub disk_check_retry_interval: Duration,
}

impl Default for MatcherOptions {
    fn default() -> Self {
        Self {
            workers: 20,
            init_concurrency: 10,
            init_job_retries: 3,
            init_job_retry_interval: Duration::from_secs(1),
            job_poll_interval: Duration::from_secs(10),
            job_poll_timeout: Duration::from_secs(7200),
            disk_check_enabled: true,
            disk_check_retries: 3,
            disk_check_retry_interval: Duration::from_secs(180),
        }
    }
}

#[derive(Clone)]
pub struct MatcherDeps {
    pub store: Arc<dyn Store>,
    pub automation: Arc<dyn AutomationApi>,
    pub inventory: Arc<dyn InventoryApi>,
    pub notify: Arc<dyn NotifyApi>,
}

/// Per-batch pipeline result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub candidates: usize,
    pub inited: usize,
    pub disk_failed: usize,
    pub delivered: usize,
}

/// What a worker did with one popped generate id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Record gone, not produced yet, already matched, or its order is finished
    Skipped,
    /// Owning order is not matchable yet; it is handed to the order reconciler,
    /// which queues the record again once the order reaches Matching
    Deferred { sub_order_id: String },
    Matched(MatchSummary),
}

pub struct Matcher {
    deps: MatcherDeps,
    options: MatcherOptions,
}

impl Matcher {
    pub fn new(deps: MatcherDeps, options: MatcherOptions) -> Self {
        Self { deps, options }
    }

    pub fn deps(&self) -> &MatcherDeps {
        &self.deps
    }

    pub fn options(&self) -> &MatcherOptions {
        &self.options
    }

    /// One worker loop; returns when the queue shuts down or on cancellation
    ///
    /// Errors are logged and the loop moves on to the next id. Cancellation is
    /// only observed between items. Deferred records push their order onto
    /// `orders`.
    pub async fn run_worker(
        self: Arc<Self>,
        worker: usize,
        informer: Arc<Informer<u64>>,
        orders: WorkQueue<String>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!(worker, "Matcher worker started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                id = informer.pop() => id,
            };
            let Some(generate_id) = next else {
                break;
            };
            match self.process(generate_id).await {
                Ok(Processed::Deferred { sub_order_id }) => {
                    tracing::debug!(worker, generate_id, sub_order_id = %sub_order_id, "Order not matchable yet, deferring");
                    orders.add(sub_order_id);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(worker, generate_id, code = %e.code, error = %e, "Matching failed");
                }
            }
        }
        tracing::debug!(worker, "Matcher worker stopped");
    }

    /// Handle one popped generate id
    ///
    /// Records not produced yet, or already matched, are skipped.
    pub async fn process(&self, generate_id: u64) -> AppResult<Processed> {
        let store = &self.deps.store;
        let record = match store.get_generate_record(generate_id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                tracing::warn!(generate_id, "Generate record not found, skipping");
                return Ok(Processed::Skipped);
            }
            Err(e) => return Err(e),
        };
        if !record.is_match_ready() {
            tracing::debug!(
                generate_id,
                status = ?record.status,
                is_matched = record.is_matched,
                "Generate record not ready for matching, skipping"
            );
            return Ok(Processed::Skipped);
        }

        let order = match store.get_apply_order(&record.sub_order_id).await {
            Ok(order) => order,
            Err(e) if e.is_not_found() => {
                tracing::warn!(generate_id, sub_order_id = %record.sub_order_id, "Apply order not found, skipping");
                return Ok(Processed::Skipped);
            }
            Err(e) => return Err(e),
        };
        if order.status.is_terminal() {
            tracing::debug!(generate_id, sub_order_id = %order.sub_order_id, status = %order.status, "Apply order finished, skipping");
            return Ok(Processed::Skipped);
        }
        if !order.status.is_match_eligible() {
            return Ok(Processed::Deferred {
                sub_order_id: order.sub_order_id,
            });
        }
        self.match_order(&order, &record).await.map(Processed::Matched)
    }

    /// Run the whole pipeline for one produced batch
    pub async fn match_handler(&self, record: &GenerateRecord) -> AppResult<MatchSummary> {
        let store = &self.deps.store;
        let order = store.get_apply_order(&record.sub_order_id).await?;
        if !order.status.is_match_eligible() {
            return Err(AppError::invalid_state(format!(
                "apply order {} is {}, not matchable",
                order.sub_order_id, order.status
            ))
            .with_detail("generate_id", record.generate_id));
        }
        self.match_order(&order, record).await
    }

    async fn match_order(&self, order: &ApplyOrder, record: &GenerateRecord) -> AppResult<MatchSummary> {
        let store = &self.deps.store;
        tracing::info!(
            sub_order_id = %order.sub_order_id,
            generate_id = record.generate_id,
            status = %order.status,
            "Matching generate record"
        );

        let devices = store.find_devices_by_generate(record.generate_id).await?;
        let summary = self.match_device(order, devices).await;

        store.mark_generate_matched(record.generate_id).await?;

        let outcome = self.update_apply_order_status(&order.sub_order_id).await?;
        if outcome.became_done()
            && let Err(e) = self.notify_ticket_done(order.order_id).await
        {
            tracing::warn!(order_id = order.order_id, error = %e, "Done notification failed");
        }

        tracing::info!(
            sub_order_id = %order.sub_order_id,
            generate_id = record.generate_id,
            candidates = summary.candidates,
            inited = summary.inited,
            disk_failed = summary.disk_failed,
            delivered = summary.delivered,
            status = %outcome.progress.status,
            "Generate record matched"
        );
        Ok(summary)
    }

    /// Init, optionally disk-check, then deliver the batch's devices
    ///
    /// Devices failing a stage drop out of the later stages and keep their
    /// flags false, so the next pass over the order picks them up again.
    pub async fn match_device(&self, order: &ApplyOrder, devices: Vec<DeviceInfo>) -> MatchSummary {
        let mut summary = MatchSummary {
            candidates: devices.len(),
            ..Default::default()
        };

        let inited = self.init_devices(order, devices).await;
        summary.inited = inited.len();

        let checked = if self.options.disk_check_enabled && order.spec.disk_check {
            let (passed, failed) = self.disk_check_devices(order, inited).await;
            summary.disk_failed = failed.len();
            passed
        } else {
            inited
        };

        summary.delivered = self.deliver_devices(order, checked).await;
        summary
    }

    /// Best-effort step bookkeeping
    async fn mark_step(&self, sub_order_id: &str, step: StepName, status: StepStatus, message: &str) {
        if let Err(e) = self
            .deps
            .store
            .update_step(sub_order_id, step, status, message)
            .await
        {
            tracing::warn!(
                sub_order_id = %sub_order_id,
                step = step.as_str(),
                error = %e,
                "Failed to update order step"
            );
        }
    }

    /// Persist a device; a failed write is logged and the in-memory copy kept
    async fn save_device(&self, device: &DeviceInfo) {
        if let Err(e) = self.deps.store.upsert_device(device).await {
            tracing::error!(
                device_id = device.id,
                ip = %device.ip,
                error = %e,
                "Failed to persist device flags"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Harness, fast_options};
    use super::*;
    use crate::clients::{JobState, JobTemplate};
    use shared::ErrorCode;
    use shared::models::{ApplyStatus, GenerateStatus, ResourceType};

    const POOL_BIZ: i64 = 1;
    const TARGET_BIZ: i64 = 300;

    async fn seed(h: &Harness, total: u32, ips: &[&str], disk_check: bool) -> GenerateRecord {
        let mut order = ApplyOrder::new("so-1", 9, TARGET_BIZ, "alice", total, ResourceType::IdcPm);
        order.status = ApplyStatus::Matching;
        order.follower = vec!["bob".into()];
        order.spec.os_type = "linux".into();
        order.spec.disk_check = disk_check;
        h.store.upsert_apply_order(&order).await.unwrap();

        let mut record = GenerateRecord::new(1, "so-1", ips.len() as u32);
        record.status = GenerateStatus::Success;
        h.store.upsert_generate_record(&record).await.unwrap();

        for (i, ip) in ips.iter().enumerate() {
            let id = i as u64 + 1;
            let mut device = DeviceInfo::new(id, "so-1", 1, *ip);
            device.asset_id = format!("ASSET-{id}");
            device.cpu_core = 4;
            h.store.upsert_device(&device).await.unwrap();
            h.inventory.add_host(ip, &device.asset_id, 100 + id, POOL_BIZ);
        }
        record
    }

    #[tokio::test]
    async fn test_full_pipeline_delivers_batch() {
        let h = Harness::new(fast_options()).unwrap();
        let record = seed(&h, 2, &["10.0.0.1", "10.0.0.2"], true).await;

        let summary = h.matcher.match_handler(&record).await.unwrap();
        assert_eq!(
            summary,
            MatchSummary {
                candidates: 2,
                inited: 2,
                disk_failed: 0,
                delivered: 2,
            }
        );

        for device in h.store.find_devices_by_generate(1).await.unwrap() {
            assert!(device.is_inited && device.is_disk_checked && device.is_delivered);
        }
        assert_eq!(h.inventory.host_biz("10.0.0.1"), Some(TARGET_BIZ));
        assert_eq!(
            h.inventory.host_operator("10.0.0.2"),
            Some(("alice".to_string(), "bob".to_string()))
        );
        assert!(h.store.get_generate_record(1).await.unwrap().is_matched);
        assert_eq!(h.store.get_apply_order("so-1").await.unwrap().status, ApplyStatus::Done);

        let init = h.store.get_step("so-1", StepName::Init).await.unwrap().unwrap();
        assert_eq!(init.status, StepStatus::Success);
        let deliver = h.store.get_step("so-1", StepName::Deliver).await.unwrap().unwrap();
        assert_eq!(deliver.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_failed_init_excludes_device() {
        let h = Harness::new(fast_options()).unwrap();
        let record = seed(&h, 3, &["10.0.0.1", "10.0.0.2", "10.0.0.3"], false).await;
        // Creation exhausts its retries for one device, the job fails for another
        h.automation.fail_creates("10.0.0.2", 10);
        h.automation.set_final_state("10.0.0.3", JobState::Failed);

        let summary = h.matcher.match_handler(&record).await.unwrap();
        assert_eq!(summary.inited, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(h.automation.create_calls("10.0.0.2"), 3);

        let devices = h.store.find_devices_by_generate(1).await.unwrap();
        let failed: Vec<_> = devices.iter().filter(|d| !d.is_inited).collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|d| !d.is_delivered));
        assert_eq!(h.inventory.host_biz("10.0.0.2"), Some(POOL_BIZ));

        let order = h.store.get_apply_order("so-1").await.unwrap();
        assert_eq!(order.status, ApplyStatus::MatchedSome);
        let init = h.store.get_step("so-1", StepName::Init).await.unwrap().unwrap();
        assert_eq!(init.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_disk_check_failures_are_excluded() {
        let h = Harness::new(fast_options()).unwrap();
        let record = seed(&h, 2, &["10.0.0.1", "10.0.0.2"], true).await;
        // One recovers on the last retry, the other never passes
        h.automation.fail_disk_checks("10.0.0.1", 2);
        h.automation.fail_disk_checks("10.0.0.2", 10);

        let summary = h.matcher.match_handler(&record).await.unwrap();
        assert_eq!(summary.inited, 2);
        assert_eq!(summary.disk_failed, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(h.automation.jobs_created(JobTemplate::DiskCheck), 6);
    }

    #[tokio::test]
    async fn test_disk_check_skipped_when_disabled() {
        let mut options = fast_options();
        options.disk_check_enabled = false;
        let h = Harness::new(options).unwrap();
        let record = seed(&h, 1, &["10.0.0.1"], true).await;

        let summary = h.matcher.match_handler(&record).await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(h.automation.jobs_created(JobTemplate::DiskCheck), 0);
    }

    #[tokio::test]
    async fn test_deliver_failure_does_not_stop_the_loop() {
        let h = Harness::new(fast_options()).unwrap();
        let record = seed(&h, 2, &["10.0.0.1", "10.0.0.2"], false).await;
        h.inventory.fail_transfers("10.0.0.1");

        let summary = h.matcher.match_handler(&record).await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(h.inventory.host_biz("10.0.0.2"), Some(TARGET_BIZ));

        let deliver = h.store.get_step("so-1", StepName::Deliver).await.unwrap().unwrap();
        assert_eq!(deliver.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_ineligible_order_is_rejected() {
        let h = Harness::new(fast_options()).unwrap();
        let record = seed(&h, 1, &["10.0.0.1"], false).await;
        let mut order = h.store.get_apply_order("so-1").await.unwrap();
        order.status = ApplyStatus::WaitForMatch;
        h.store.upsert_apply_order(&order).await.unwrap();

        let err = h.matcher.match_handler(&record).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOrderStatus);
        assert!(!h.store.get_generate_record(1).await.unwrap().is_matched);
        assert_eq!(h.automation.jobs_created(JobTemplate::Init), 0);
    }

    #[tokio::test]
    async fn test_matched_record_is_never_reentered() {
        let h = Harness::new(fast_options()).unwrap();
        seed(&h, 1, &["10.0.0.1"], false).await;

        assert!(matches!(h.matcher.process(1).await.unwrap(), Processed::Matched(_)));
        let transfers = h.inventory.transfer_count();

        // Re-delivered by the informer
        assert_eq!(h.matcher.process(1).await.unwrap(), Processed::Skipped);
        assert_eq!(h.inventory.transfer_count(), transfers);
        assert_eq!(h.automation.jobs_created(JobTemplate::Init), 1);
    }

    #[tokio::test]
    async fn test_unready_and_missing_records_are_skipped() {
        let h = Harness::new(fast_options()).unwrap();
        let mut record = GenerateRecord::new(7, "so-x", 1);
        record.status = GenerateStatus::Handling;
        h.store.upsert_generate_record(&record).await.unwrap();

        assert_eq!(h.matcher.process(7).await.unwrap(), Processed::Skipped);
        assert_eq!(h.matcher.process(404).await.unwrap(), Processed::Skipped);
    }

    #[tokio::test]
    async fn test_unmatchable_order_defers_and_finished_order_skips() {
        let h = Harness::new(fast_options()).unwrap();
        seed(&h, 1, &["10.0.0.1"], false).await;
        let mut order = h.store.get_apply_order("so-1").await.unwrap();

        for status in [ApplyStatus::WaitForMatch, ApplyStatus::MatchedSome] {
            order.status = status;
            h.store.upsert_apply_order(&order).await.unwrap();
            assert_eq!(
                h.matcher.process(1).await.unwrap(),
                Processed::Deferred {
                    sub_order_id: "so-1".into()
                }
            );
        }

        order.status = ApplyStatus::Terminate;
        h.store.upsert_apply_order(&order).await.unwrap();
        assert_eq!(h.matcher.process(1).await.unwrap(), Processed::Skipped);

        assert!(!h.store.get_generate_record(1).await.unwrap().is_matched);
        assert_eq!(h.automation.jobs_created(JobTemplate::Init), 0);
    }

    #[tokio::test]
    async fn test_already_inited_devices_skip_init() {
        let h = Harness::new(fast_options()).unwrap();
        let record = seed(&h, 1, &["10.0.0.1"], false).await;
        let mut device = h.store.find_devices_by_generate(1).await.unwrap().remove(0);
        device.is_inited = true;
        h.store.upsert_device(&device).await.unwrap();

        let summary = h.matcher.match_handler(&record).await.unwrap();
        assert_eq!(summary.inited, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(h.automation.jobs_created(JobTemplate::Init), 0);
    }
}
