//! Apply Order Model (资源申请子单)

use serde::{Deserialize, Serialize};

/// Apply order status
///
/// Recomputed from generate records and delivered devices after every
/// matching pass. Only `GracefulTerminate` is ever requested from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyStatus {
    WaitForMatch,
    MatchedSome,
    Matching,
    GracefulTerminate,
    Terminate,
    Done,
}

impl ApplyStatus {
    /// Statuses listed by the order informer on startup
    pub const ACTIVE: [ApplyStatus; 2] = [ApplyStatus::WaitForMatch, ApplyStatus::MatchedSome];

    /// Whether the matcher may run a pipeline pass against the order
    pub fn is_match_eligible(&self) -> bool {
        matches!(self, ApplyStatus::Matching | ApplyStatus::GracefulTerminate)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ApplyStatus::Terminate | ApplyStatus::Done)
    }

    /// Stage mirrors status
    pub fn stage(&self) -> ApplyStage {
        match self {
            ApplyStatus::Done => ApplyStage::Done,
            ApplyStatus::Terminate => ApplyStage::Terminate,
            _ => ApplyStage::Running,
        }
    }
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplyStatus::WaitForMatch => "WAIT_FOR_MATCH",
            ApplyStatus::MatchedSome => "MATCHED_SOME",
            ApplyStatus::Matching => "MATCHING",
            ApplyStatus::GracefulTerminate => "GRACEFUL_TERMINATE",
            ApplyStatus::Terminate => "TERMINATE",
            ApplyStatus::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// Stage shared by apply orders and tickets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyStage {
    #[default]
    Running,
    Done,
    Terminate,
}

/// Kind of resource requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    /// Cloud virtual machine
    Cvm,
    /// Physical machine in an IDC
    IdcPm,
    /// Docker virtual machine hosted in an IDC
    IdcDvm,
    Others,
}

impl ResourceType {
    /// Resource types counted against the delivered-core quota
    pub fn requires_quota(&self) -> bool {
        matches!(self, ResourceType::Cvm | ResourceType::IdcPm)
    }
}

/// Demand planning category of the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequireType {
    #[default]
    Regular,
    Spring,
    Dissolve,
    Emergency,
}

/// Provisioning parameters carried by the order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApplySpec {
    /// OS family passed to the init job (e.g. "linux", "windows")
    pub os_type: String,
    /// Whether delivered devices must pass a disk check first
    #[serde(default)]
    pub disk_check: bool,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub zone: String,
}

/// Apply order - one sub-order of a ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOrder {
    pub sub_order_id: String,
    /// Ticket id, groups sub-orders
    pub order_id: u64,
    /// Target business
    pub biz_id: i64,
    /// Applicant
    pub user: String,
    /// Backup operator written onto delivered hosts
    #[serde(default)]
    pub follower: Vec<String>,
    /// Requested device count
    pub total: u32,
    pub status: ApplyStatus,
    #[serde(default)]
    pub stage: ApplyStage,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub require_type: RequireType,
    #[serde(default)]
    pub spec: ApplySpec,
    /// Cores already added to the rolling delivered counter
    #[serde(default)]
    pub delivered_core: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApplyOrder {
    pub fn new(
        sub_order_id: impl Into<String>,
        order_id: u64,
        biz_id: i64,
        user: impl Into<String>,
        total: u32,
        resource_type: ResourceType,
    ) -> Self {
        let now = crate::util::now_millis();
        Self {
            sub_order_id: sub_order_id.into(),
            order_id,
            biz_id,
            user: user.into(),
            follower: Vec::new(),
            total,
            status: ApplyStatus::WaitForMatch,
            stage: ApplyStage::Running,
            resource_type,
            require_type: RequireType::default(),
            spec: ApplySpec::default(),
            delivered_core: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Comma-joined follower list, as written to host operator fields
    pub fn bak_operator(&self) -> String {
        self.follower.join(",")
    }
}
