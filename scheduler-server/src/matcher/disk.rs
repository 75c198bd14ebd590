//! Disk-check stage

use super::Matcher;
use super::job::{resolve_host_biz, wait_for_job};
use super::pool::{Concurrency, run_all};
use crate::clients::{CreateJobRequest, JobTemplate};
use shared::models::{ApplyOrder, DeviceInfo};
use shared::{AppError, AppResult};
use std::collections::HashMap;

impl Matcher {
    /// Check every device concurrently, returns `(passed, failed)`
    pub(super) async fn disk_check_devices(
        &self,
        order: &ApplyOrder,
        devices: Vec<DeviceInfo>,
    ) -> (Vec<DeviceInfo>, Vec<(DeviceInfo, AppError)>) {
        let results = run_all(
            devices.into_iter().map(|device| self.check_device(order, device)),
            Concurrency::Unbounded,
        )
        .await;

        let mut passed = Vec::new();
        let mut failed = Vec::new();
        for result in results {
            match result {
                Ok(device) => passed.push(device),
                Err(pair) => failed.push(pair),
            }
        }
        if !failed.is_empty() {
            let ips: Vec<&str> = failed.iter().map(|(d, _)| d.ip.as_str()).collect();
            tracing::warn!(
                sub_order_id = %order.sub_order_id,
                failed = failed.len(),
                ips = ?ips,
                "Devices failed disk check, excluded from delivery"
            );
        }
        (passed, failed)
    }

    async fn check_device(
        &self,
        order: &ApplyOrder,
        mut device: DeviceInfo,
    ) -> Result<DeviceInfo, (DeviceInfo, AppError)> {
        if device.is_disk_checked {
            return Ok(device);
        }

        let attempts = self.options.disk_check_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.run_disk_check(order, &device).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        device_id = device.id,
                        ip = %device.ip,
                        attempt,
                        attempts,
                        error = %e,
                        "Disk check failed"
                    );
                    last_err = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.disk_check_retry_interval).await;
            }
        }

        if let Some(e) = last_err {
            return Err((device, e));
        }
        device.is_disk_checked = true;
        self.save_device(&device).await;
        tracing::info!(device_id = device.id, ip = %device.ip, "Disk check passed");
        Ok(device)
    }

    async fn run_disk_check(&self, order: &ApplyOrder, device: &DeviceInfo) -> AppResult<()> {
        let (_host_id, biz_id) = resolve_host_biz(self.deps.inventory.as_ref(), &device.ip).await?;
        let mut params = HashMap::new();
        params.insert("sub_order_id".to_string(), order.sub_order_id.clone());
        let request = CreateJobRequest {
            ip: device.ip.clone(),
            biz_id,
            os_type: order.spec.os_type.clone(),
            template: JobTemplate::DiskCheck,
            params,
        };
        let handle = self.deps.automation.create_job(&request).await?;
        wait_for_job(
            self.deps.automation.as_ref(),
            &handle.job_id,
            biz_id,
            self.options.job_poll_interval,
            self.options.job_poll_timeout,
        )
        .await
    }
}
