//! Init stage: OS initialization jobs for freshly produced devices

use super::Matcher;
use super::job::{create_job_with_retry, resolve_host_biz, wait_for_job};
use super::pool::{Concurrency, run_all};
use crate::clients::{CreateJobRequest, JobTemplate};
use shared::AppResult;
use shared::models::{ApplyOrder, DeviceInfo, InitRecord, RecordStatus, StepName, StepStatus};
use std::collections::HashMap;

/// Device whose init job was created and awaits completion
struct PendingInit {
    device: DeviceInfo,
    record: InitRecord,
    job_id: String,
    biz_id: i64,
}

impl Matcher {
    /// Returns the devices that are inited after this stage
    ///
    /// Job creation fans out with the configured bound; jobs that were created
    /// are then awaited concurrently.
    pub(super) async fn init_devices(&self, order: &ApplyOrder, devices: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
        let (mut ready, todo): (Vec<_>, Vec<_>) = devices.into_iter().partition(|d| d.is_inited);
        if todo.is_empty() {
            return ready;
        }

        let candidates = todo.len();
        self.mark_step(&order.sub_order_id, StepName::Init, StepStatus::Handling, "")
            .await;

        let created = run_all(
            todo.into_iter().map(|device| self.start_init(order, device)),
            Concurrency::Bounded(self.options.init_concurrency),
        )
        .await;
        let pending: Vec<PendingInit> = created.into_iter().flatten().collect();
        if pending.len() < candidates {
            tracing::warn!(
                sub_order_id = %order.sub_order_id,
                failed = candidates - pending.len(),
                "Init job creation failed for some devices, they stay un-inited"
            );
        }

        let finished = run_all(
            pending.into_iter().map(|p| self.finish_init(p)),
            Concurrency::Unbounded,
        )
        .await;
        let inited: Vec<DeviceInfo> = finished.into_iter().flatten().collect();

        let failed = candidates - inited.len();
        if failed == 0 {
            self.mark_step(&order.sub_order_id, StepName::Init, StepStatus::Success, "")
                .await;
        } else {
            let message = format!("{failed} of {candidates} devices failed to init");
            self.mark_step(&order.sub_order_id, StepName::Init, StepStatus::Failed, &message)
                .await;
        }

        ready.extend(inited);
        ready
    }

    /// Write the init record and create the job
    async fn start_init(&self, order: &ApplyOrder, device: DeviceInfo) -> Option<PendingInit> {
        let mut record = InitRecord::new(&device.sub_order_id, device.generate_id, device.id, &device.ip);
        if let Err(e) = self.deps.store.insert_init_record(&record).await {
            tracing::error!(device_id = device.id, ip = %device.ip, error = %e, "Failed to write init record");
            return None;
        }

        match self.create_init_job(order, &device, &mut record).await {
            Ok((job_id, biz_id)) => Some(PendingInit {
                device,
                record,
                job_id,
                biz_id,
            }),
            Err(e) => {
                tracing::warn!(
                    sub_order_id = %order.sub_order_id,
                    device_id = device.id,
                    ip = %device.ip,
                    error = %e,
                    "Init job not created, device excluded"
                );
                self.close_init_record(&mut record, RecordStatus::Failed, &e.message)
                    .await;
                None
            }
        }
    }

    async fn create_init_job(
        &self,
        order: &ApplyOrder,
        device: &DeviceInfo,
        record: &mut InitRecord,
    ) -> AppResult<(String, i64)> {
        let (_host_id, biz_id) = resolve_host_biz(self.deps.inventory.as_ref(), &device.ip).await?;
        record.biz_id = Some(biz_id);

        let mut params = HashMap::new();
        params.insert("sub_order_id".to_string(), order.sub_order_id.clone());
        params.insert("device_type".to_string(), device.device_type.clone());
        let request = CreateJobRequest {
            ip: device.ip.clone(),
            biz_id,
            os_type: order.spec.os_type.clone(),
            template: JobTemplate::Init,
            params,
        };
        let handle = create_job_with_retry(
            self.deps.automation.as_ref(),
            &request,
            self.options.init_job_retries,
            self.options.init_job_retry_interval,
        )
        .await?;

        record.job_id = Some(handle.job_id.clone());
        record.job_link = Some(handle.job_url.clone());
        if let Err(e) = self.deps.store.update_init_record(record).await {
            tracing::warn!(device_id = device.id, job_id = %handle.job_id, error = %e, "Failed to record init job");
        }
        tracing::info!(device_id = device.id, ip = %device.ip, job_id = %handle.job_id, "Init job created");
        Ok((handle.job_id, biz_id))
    }

    /// Wait for the job and flip `is_inited`
    async fn finish_init(&self, pending: PendingInit) -> Option<DeviceInfo> {
        let PendingInit {
            mut device,
            mut record,
            job_id,
            biz_id,
        } = pending;

        let result = wait_for_job(
            self.deps.automation.as_ref(),
            &job_id,
            biz_id,
            self.options.job_poll_interval,
            self.options.job_poll_timeout,
        )
        .await;

        match result {
            Ok(()) => {
                device.is_inited = true;
                self.save_device(&device).await;
                self.close_init_record(&mut record, RecordStatus::Success, "")
                    .await;
                tracing::info!(device_id = device.id, ip = %device.ip, job_id = %job_id, "Device inited");
                Some(device)
            }
            Err(e) => {
                tracing::warn!(
                    device_id = device.id,
                    ip = %device.ip,
                    job_id = %job_id,
                    error = %e,
                    "Init job failed, device excluded"
                );
                self.close_init_record(&mut record, RecordStatus::Failed, &e.message)
                    .await;
                None
            }
        }
    }

    async fn close_init_record(&self, record: &mut InitRecord, status: RecordStatus, message: &str) {
        record.status = status;
        record.message = message.to_string();
        if let Err(e) = self.deps.store.update_init_record(record).await {
            tracing::warn!(record_id = %record.id, error = %e, "Failed to update init record");
        }
    }
}
