//! Ticket completion notification

use super::Matcher;
use shared::AppResult;
use shared::models::ApplyStatus;

pub(crate) fn done_message(ticket_id: u64, biz_name: &str, delivered: usize) -> String {
    format!(
        "Resource apply ticket {ticket_id} for business [{biz_name}] is complete: {delivered} device(s) delivered."
    )
}

impl Matcher {
    /// Notify the ticket's user and followers once every sibling order is Done
    ///
    /// Returns whether the ticket was complete. Per-recipient send failures
    /// are logged only.
    pub async fn notify_ticket_done(&self, order_id: u64) -> AppResult<bool> {
        let store = &self.deps.store;
        let orders = store.find_apply_orders_by_ticket(order_id).await?;
        if orders.is_empty() || orders.iter().any(|o| o.status != ApplyStatus::Done) {
            return Ok(false);
        }
        let ticket = store.get_ticket(order_id).await?;

        let mut delivered = 0;
        for order in &orders {
            let devices = store.find_devices_by_order(&order.sub_order_id).await?;
            delivered += devices.iter().filter(|d| d.is_delivered).count();
        }

        let biz_name = match self.deps.inventory.biz_name(ticket.biz_id).await {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => ticket.biz_id.to_string(),
            Err(e) => {
                tracing::warn!(biz_id = ticket.biz_id, error = %e, "Failed to resolve business name");
                ticket.biz_id.to_string()
            }
        };
        let content = done_message(order_id, &biz_name, delivered);

        for user in ticket.recipients() {
            match self.deps.notify.send(&user, &content).await {
                Ok(result) if result.is_ok() => {
                    tracing::info!(order_id, user = %user, "Done notification sent");
                }
                Ok(result) => {
                    tracing::warn!(
                        order_id,
                        user = %user,
                        code = result.code,
                        message = %result.message,
                        "Done notification rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(order_id, user = %user, error = %e, "Done notification failed");
                }
            }
        }
        Ok(true)
    }
}
