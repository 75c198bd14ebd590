//! Notice Model (待发送通知)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub notice_id: u64,
    /// Recipient
    pub user: String,
    pub content: String,
    #[serde(default)]
    pub sent: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Notice {
    pub fn new(notice_id: u64, user: impl Into<String>, content: impl Into<String>) -> Self {
        let now = crate::util::now_millis();
        Self {
            notice_id,
            user: user.into(),
            content: content.into(),
            sent: false,
            created_at: now,
            updated_at: now,
        }
    }
}
