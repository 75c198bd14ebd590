//! Apply Ticket Model (资源申请单)

use super::apply_order::{ApplyStage, ApplyStatus};
use serde::{Deserialize, Serialize};

/// A ticket groups one or more apply orders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyTicket {
    pub order_id: u64,
    pub biz_id: i64,
    pub user: String,
    #[serde(default)]
    pub followers: Vec<String>,
    #[serde(default)]
    pub stage: ApplyStage,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApplyTicket {
    pub fn new(order_id: u64, biz_id: i64, user: impl Into<String>) -> Self {
        let now = crate::util::now_millis();
        Self {
            order_id,
            biz_id,
            user: user.into(),
            followers: Vec::new(),
            stage: ApplyStage::Running,
            created_at: now,
            updated_at: now,
        }
    }

    /// Notification recipients: applicant first, then followers, no duplicates
    pub fn recipients(&self) -> Vec<String> {
        let mut out = vec![self.user.clone()];
        for f in &self.followers {
            if !f.is_empty() && !out.contains(f) {
                out.push(f.clone());
            }
        }
        out
    }
}

/// Derive a ticket stage from its member order statuses
///
/// All done ⇒ Done; all terminal with at least one terminated ⇒ Terminate;
/// anything else (including no members) ⇒ Running.
pub fn derive_ticket_stage(statuses: &[ApplyStatus]) -> ApplyStage {
    if statuses.is_empty() {
        return ApplyStage::Running;
    }
    if statuses.iter().all(|s| *s == ApplyStatus::Done) {
        return ApplyStage::Done;
    }
    if statuses.iter().all(|s| s.is_terminal()) {
        return ApplyStage::Terminate;
    }
    ApplyStage::Running
}
