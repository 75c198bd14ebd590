//! Deliver stage: hand devices over to the requesting business

use super::Matcher;
use shared::AppResult;
use shared::models::{ApplyOrder, DeliverRecord, DeviceInfo, RecordStatus, StepName, StepStatus};

impl Matcher {
    /// Deliver devices one by one, returns how many were delivered in this pass
    ///
    /// A failed device is recorded and skipped; the loop always continues.
    pub(super) async fn deliver_devices(&self, order: &ApplyOrder, devices: Vec<DeviceInfo>) -> usize {
        let todo: Vec<DeviceInfo> = devices.into_iter().filter(|d| !d.is_delivered).collect();
        if todo.is_empty() {
            return 0;
        }

        let candidates = todo.len();
        self.mark_step(&order.sub_order_id, StepName::Deliver, StepStatus::Handling, "")
            .await;

        let mut delivered = 0;
        for device in todo {
            if self.deliver_device(order, device).await {
                delivered += 1;
            }
        }

        if delivered == candidates {
            self.mark_step(&order.sub_order_id, StepName::Deliver, StepStatus::Success, "")
                .await;
        } else {
            let message = format!("{} of {} devices failed to deliver", candidates - delivered, candidates);
            self.mark_step(&order.sub_order_id, StepName::Deliver, StepStatus::Failed, &message)
                .await;
        }
        delivered
    }

    async fn deliver_device(&self, order: &ApplyOrder, mut device: DeviceInfo) -> bool {
        let mut record = DeliverRecord::new(
            &device.sub_order_id,
            device.generate_id,
            device.id,
            &device.ip,
            &device.asset_id,
            order.biz_id,
        );
        if let Err(e) = self.deps.store.insert_deliver_record(&record).await {
            tracing::error!(device_id = device.id, ip = %device.ip, error = %e, "Failed to write deliver record");
            return false;
        }

        let result = self.transfer_to_business(order, &device).await;
        match result {
            Ok(()) => {
                device.is_delivered = true;
                self.save_device(&device).await;
                record.status = RecordStatus::Success;
                tracing::info!(
                    sub_order_id = %order.sub_order_id,
                    device_id = device.id,
                    ip = %device.ip,
                    biz_id = order.biz_id,
                    "Device delivered"
                );
            }
            Err(ref e) => {
                tracing::warn!(
                    sub_order_id = %order.sub_order_id,
                    device_id = device.id,
                    ip = %device.ip,
                    error = %e,
                    "Delivery failed, device skipped"
                );
                record.status = RecordStatus::Failed;
                record.message = e.message.clone();
            }
        }
        if let Err(e) = self.deps.store.update_deliver_record(&record).await {
            tracing::warn!(record_id = %record.id, error = %e, "Failed to update deliver record");
        }
        result.is_ok()
    }

    /// Move the host into the order's business and set its operators
    async fn transfer_to_business(&self, order: &ApplyOrder, device: &DeviceInfo) -> AppResult<()> {
        let inventory = self.deps.inventory.as_ref();
        let host_id = if device.asset_id.is_empty() {
            inventory.host_id_by_ip(&device.ip).await?
        } else {
            inventory.host_id_by_asset(&device.asset_id).await?
        };

        let current = inventory.biz_ids_by_host(host_id).await?;
        match current.first() {
            Some(&biz) if biz == order.biz_id => {
                tracing::debug!(host_id, biz_id = biz, "Host already in target business");
            }
            Some(&biz) => inventory.transfer_host(host_id, biz, order.biz_id).await?,
            None => {
                return Err(shared::AppError::with_message(
                    shared::ErrorCode::HostNotFound,
                    format!("host {host_id} has no business"),
                ));
            }
        }

        inventory
            .update_host_operator(host_id, &order.user, &order.bak_operator())
            .await
    }
}
