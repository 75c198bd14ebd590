//! Persistent store contracts
//!
//! The scheduler talks to its store through two narrow traits:
//!
//! - [`Store`]: find / insert / update of the scheduling records
//! - [`ChangeFeed`]: an ordered, resumable stream of insert/update/delete
//!   events per collection
//!
//! [`RedbStore`] implements both (plus the resume-token store used by the
//! informers) on top of an embedded redb database; [`JournalCompactor`]
//! trims its change journal behind the informers' resume tokens.

mod compactor;
mod error;
mod redb_store;

pub use compactor::JournalCompactor;
pub use redb_store::RedbStore;
pub use error::{StorageError, StorageResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::models::{
    ApplyOrder, ApplyStage, ApplyStatus, ApplyTicket, DeliverRecord, DeviceInfo, GenerateRecord,
    GenerateStatus, InitRecord, Notice, OrderStep, StepName, StepStatus,
};
use shared::AppResult;
use tokio::sync::mpsc;

/// Collection names
pub mod collection {
    pub const APPLY_ORDER: &str = "apply_order";
    pub const APPLY_TICKET: &str = "apply_ticket";
    pub const GENERATE_RECORD: &str = "generate_record";
    pub const DEVICE_INFO: &str = "device_info";
    pub const INIT_RECORD: &str = "init_record";
    pub const DELIVER_RECORD: &str = "deliver_record";
    pub const ORDER_STEP: &str = "order_step";
    pub const NOTICE: &str = "notice";
}

/// Change operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// One change-feed event
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
    pub operation: OperationType,
    /// JSON document after the change (the removed document for deletes)
    pub document: Vec<u8>,
    /// Opaque resume token; resuming from it yields the events after this one
    pub token: String,
    pub event_id: String,
    /// Wall-clock position of the change (millis)
    pub cursor: Option<i64>,
}

/// Where a subscription starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchStart {
    /// Resume after a previously issued token
    Token(String),
    /// Only changes committed after the subscription
    Now,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to the changes of one collection
    ///
    /// The receiver closes when the subscription is lost (lagging consumer,
    /// store shut down); callers resubscribe from their last applied token.
    async fn watch(&self, collection: &str, start: WatchStart)
    -> AppResult<mpsc::Receiver<ChangeEvent>>;

    /// Token of the newest change recorded for the collection
    async fn latest_token(&self, collection: &str) -> AppResult<Option<String>>;
}

/// Fields written together when an order's status is recomputed
///
/// The write only applies while the stored order still has `from_status` and
/// `from_core`, so of two concurrent recomputes only one moves the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatusUpdate {
    pub from_status: ApplyStatus,
    pub from_core: u32,
    pub status: ApplyStatus,
    pub stage: ApplyStage,
    pub delivered_core: Option<u32>,
}

/// Store contract consumed by informers, matcher and reconcilers
///
/// Missing records are reported with a not-found [`shared::AppError`]
/// (`err.is_not_found()`).
#[async_trait]
pub trait Store: Send + Sync {
    // ========== Apply orders ==========
    async fn get_apply_order(&self, sub_order_id: &str) -> AppResult<ApplyOrder>;
    async fn find_apply_orders(&self, statuses: &[ApplyStatus]) -> AppResult<Vec<ApplyOrder>>;
    async fn find_apply_orders_by_ticket(&self, order_id: u64) -> AppResult<Vec<ApplyOrder>>;
    async fn upsert_apply_order(&self, order: &ApplyOrder) -> AppResult<()>;
    /// Compare-and-set on status and delivered cores, returns whether it applied
    async fn update_apply_order_status(
        &self,
        sub_order_id: &str,
        update: &OrderStatusUpdate,
    ) -> AppResult<bool>;

    // ========== Tickets ==========
    async fn get_ticket(&self, order_id: u64) -> AppResult<ApplyTicket>;
    async fn find_running_tickets(&self) -> AppResult<Vec<ApplyTicket>>;
    async fn upsert_ticket(&self, ticket: &ApplyTicket) -> AppResult<()>;
    async fn update_ticket_stage(&self, order_id: u64, stage: ApplyStage) -> AppResult<()>;

    // ========== Generate records ==========
    async fn get_generate_record(&self, generate_id: u64) -> AppResult<GenerateRecord>;
    async fn find_generate_records_by_order(
        &self,
        sub_order_id: &str,
    ) -> AppResult<Vec<GenerateRecord>>;
    /// Records still producing, or produced but not matched yet
    async fn find_pending_generate_records(&self) -> AppResult<Vec<GenerateRecord>>;
    async fn upsert_generate_record(&self, record: &GenerateRecord) -> AppResult<()>;
    async fn mark_generate_matched(&self, generate_id: u64) -> AppResult<()>;
    async fn update_generate_status(
        &self,
        generate_id: u64,
        status: GenerateStatus,
        message: &str,
    ) -> AppResult<()>;

    // ========== Devices ==========
    async fn find_devices_by_generate(&self, generate_id: u64) -> AppResult<Vec<DeviceInfo>>;
    async fn find_devices_by_order(&self, sub_order_id: &str) -> AppResult<Vec<DeviceInfo>>;
    /// Insert or update a device; flags already true in the store stay true
    async fn upsert_device(&self, device: &DeviceInfo) -> AppResult<()>;

    // ========== Audit records ==========
    async fn insert_init_record(&self, record: &InitRecord) -> AppResult<()>;
    async fn update_init_record(&self, record: &InitRecord) -> AppResult<()>;
    async fn insert_deliver_record(&self, record: &DeliverRecord) -> AppResult<()>;
    async fn update_deliver_record(&self, record: &DeliverRecord) -> AppResult<()>;

    // ========== Steps ==========
    async fn update_step(
        &self,
        sub_order_id: &str,
        step: StepName,
        status: StepStatus,
        message: &str,
    ) -> AppResult<()>;
    async fn get_step(&self, sub_order_id: &str, step: StepName) -> AppResult<Option<OrderStep>>;

    // ========== Quota ==========
    /// Add `delta` cores to the business' rolling delivered counter, returns the new total
    async fn add_delivered_cores(&self, biz_id: i64, delta: i64) -> AppResult<i64>;

    // ========== Notices ==========
    async fn get_notice(&self, notice_id: u64) -> AppResult<Notice>;
    async fn find_unsent_notices(&self) -> AppResult<Vec<Notice>>;
    async fn upsert_notice(&self, notice: &Notice) -> AppResult<()>;
    async fn mark_notice_sent(&self, notice_id: u64) -> AppResult<()>;
}
