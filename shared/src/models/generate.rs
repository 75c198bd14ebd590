//! Generate Record Model (设备生产批次)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerateStatus {
    Init,
    Handling,
    Success,
    Failed,
    Suspend,
}

/// One device-generation batch produced for a sub-order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRecord {
    pub generate_id: u64,
    pub sub_order_id: String,
    pub status: GenerateStatus,
    /// Devices requested in this batch
    #[serde(default)]
    pub total_num: u32,
    /// Devices actually produced
    #[serde(default)]
    pub success_num: u32,
    /// Set once, after the batch went through the whole matching pipeline
    #[serde(default)]
    pub is_matched: bool,
    #[serde(default)]
    pub message: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl GenerateRecord {
    pub fn new(generate_id: u64, sub_order_id: impl Into<String>, total_num: u32) -> Self {
        let now = crate::util::now_millis();
        Self {
            generate_id,
            sub_order_id: sub_order_id.into(),
            status: GenerateStatus::Init,
            total_num,
            success_num: 0,
            is_matched: false,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Ready for the matcher: produced and not yet matched
    pub fn is_match_ready(&self) -> bool {
        self.status == GenerateStatus::Success && !self.is_matched
    }

    /// Still producing devices, or produced but not yet through the pipeline
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, GenerateStatus::Init | GenerateStatus::Handling)
            || self.is_match_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight() {
        let mut record = GenerateRecord::new(1, "so-1", 2);
        assert!(record.is_in_flight());
        assert!(!record.is_match_ready());

        record.status = GenerateStatus::Success;
        assert!(record.is_match_ready());
        assert!(record.is_in_flight());

        record.is_matched = true;
        assert!(!record.is_match_ready());
        assert!(!record.is_in_flight());

        record.status = GenerateStatus::Suspend;
        assert!(!record.is_in_flight());
    }
}
