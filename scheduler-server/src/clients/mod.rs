//! External collaborators
//!
//! The matcher and reconcilers only see these traits. `http` holds the
//! `reqwest` implementations; tests use the mocks in `matcher::testing`.

pub mod http;

pub use http::{AutomationClient, InventoryClient, NotifyClient};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::AppResult;
use std::collections::HashMap;

/// Job template run by the automation system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTemplate {
    /// OS initialization of a freshly produced device
    Init,
    /// Disk health check before delivery
    DiskCheck,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateJobRequest {
    pub ip: String,
    pub biz_id: i64,
    pub os_type: String,
    pub template: JobTemplate,
    pub params: HashMap<String, String>,
}

/// Handle of a created job
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    #[serde(default)]
    pub job_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Running,
    Finished,
    Failed,
    Suspended,
    Revoked,
}

impl JobState {
    /// No further transitions expected
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Suspended | JobState::Revoked
        )
    }

    pub fn is_success(&self) -> bool {
        *self == JobState::Finished
    }
}

/// Automation / orchestration system
#[async_trait]
pub trait AutomationApi: Send + Sync {
    async fn create_job(&self, request: &CreateJobRequest) -> AppResult<JobHandle>;
    async fn job_status(&self, job_id: &str, biz_id: i64) -> AppResult<JobState>;
}

/// Inventory / CMDB
#[async_trait]
pub trait InventoryApi: Send + Sync {
    async fn host_id_by_ip(&self, ip: &str) -> AppResult<u64>;
    async fn host_id_by_asset(&self, asset_id: &str) -> AppResult<u64>;
    async fn biz_ids_by_host(&self, host_id: u64) -> AppResult<Vec<i64>>;
    /// Move a host from one business into another
    async fn transfer_host(&self, host_id: u64, from_biz: i64, to_biz: i64) -> AppResult<()>;
    async fn update_host_operator(
        &self,
        host_id: u64,
        operator: &str,
        bak_operator: &str,
    ) -> AppResult<()>;
    async fn biz_name(&self, biz_id: i64) -> AppResult<String>;
}

/// Result pair returned by the notification system
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotifyResult {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl NotifyResult {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Chat notification system
#[async_trait]
pub trait NotifyApi: Send + Sync {
    async fn send(&self, user: &str, content: &str) -> AppResult<NotifyResult>;
}
