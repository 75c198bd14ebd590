//! Audit records for remote side effects, and per-order step tracking
//!
//! An init/deliver record is written *before* the remote call and updated
//! with its outcome afterwards.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Handling,
    Success,
    Failed,
}

/// Device initialization attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRecord {
    pub id: String,
    pub sub_order_id: String,
    pub generate_id: u64,
    pub device_id: u64,
    pub ip: String,
    pub biz_id: Option<i64>,
    pub job_id: Option<String>,
    pub job_link: Option<String>,
    pub status: RecordStatus,
    #[serde(default)]
    pub message: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl InitRecord {
    pub fn new(sub_order_id: &str, generate_id: u64, device_id: u64, ip: &str) -> Self {
        let now = crate::util::now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sub_order_id: sub_order_id.to_string(),
            generate_id,
            device_id,
            ip: ip.to_string(),
            biz_id: None,
            job_id: None,
            job_link: None,
            status: RecordStatus::Handling,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Device delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverRecord {
    pub id: String,
    pub sub_order_id: String,
    pub generate_id: u64,
    pub device_id: u64,
    pub ip: String,
    pub asset_id: String,
    /// Business the host is moved into
    pub biz_id: i64,
    pub status: RecordStatus,
    #[serde(default)]
    pub message: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeliverRecord {
    pub fn new(
        sub_order_id: &str,
        generate_id: u64,
        device_id: u64,
        ip: &str,
        asset_id: &str,
        biz_id: i64,
    ) -> Self {
        let now = crate::util::now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sub_order_id: sub_order_id.to_string(),
            generate_id,
            device_id,
            ip: ip.to_string(),
            asset_id: asset_id.to_string(),
            biz_id,
            status: RecordStatus::Handling,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Named step of an apply order's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Commit,
    Generate,
    Init,
    Deliver,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Commit => "commit",
            StepName::Generate => "generate",
            StepName::Init => "init",
            StepName::Deliver => "deliver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Todo,
    Handling,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStep {
    pub sub_order_id: String,
    pub step: StepName,
    pub status: StepStatus,
    #[serde(default)]
    pub message: String,
    pub updated_at: i64,
}
