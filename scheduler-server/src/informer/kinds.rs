//! Informer configuration per watched record type

use super::InformerSpec;
use crate::store::{Store, collection};
use futures::future::BoxFuture;
use serde_json::Value;
use shared::AppResult;
use shared::models::ApplyStatus;

/// Apply orders waiting for (more) devices, keyed by sub-order id
pub fn order() -> InformerSpec<String> {
    InformerSpec {
        name: "apply_order",
        collection: collection::APPLY_ORDER,
        token_key: "apply_order",
        list: list_orders,
        extract: |doc| extract_string(doc, "sub_order_id"),
    }
}

/// Running tickets, keyed by ticket id
pub fn ticket() -> InformerSpec<u64> {
    InformerSpec {
        name: "apply_ticket",
        collection: collection::APPLY_TICKET,
        token_key: "apply_ticket",
        list: list_tickets,
        extract: |doc| extract_u64(doc, "order_id"),
    }
}

/// Generate records not yet through the pipeline, keyed by generate id
pub fn generate() -> InformerSpec<u64> {
    InformerSpec {
        name: "generate_record",
        collection: collection::GENERATE_RECORD,
        token_key: "generate_record",
        list: list_generate_records,
        extract: |doc| extract_u64(doc, "generate_id"),
    }
}

/// Unsent notices, keyed by notice id
pub fn notice() -> InformerSpec<u64> {
    InformerSpec {
        name: "notice",
        collection: collection::NOTICE,
        token_key: "notice",
        list: list_notices,
        extract: |doc| extract_u64(doc, "notice_id"),
    }
}

fn list_orders(store: &dyn Store) -> BoxFuture<'_, AppResult<Vec<String>>> {
    Box::pin(async move {
        let orders = store.find_apply_orders(&ApplyStatus::ACTIVE).await?;
        Ok(orders.into_iter().map(|o| o.sub_order_id).collect())
    })
}

fn list_tickets(store: &dyn Store) -> BoxFuture<'_, AppResult<Vec<u64>>> {
    Box::pin(async move {
        let tickets = store.find_running_tickets().await?;
        Ok(tickets.into_iter().map(|t| t.order_id).collect())
    })
}

fn list_generate_records(store: &dyn Store) -> BoxFuture<'_, AppResult<Vec<u64>>> {
    Box::pin(async move {
        let records = store.find_pending_generate_records().await?;
        Ok(records.into_iter().map(|r| r.generate_id).collect())
    })
}

fn list_notices(store: &dyn Store) -> BoxFuture<'_, AppResult<Vec<u64>>> {
    Box::pin(async move {
        let notices = store.find_unsent_notices().await?;
        Ok(notices.into_iter().map(|n| n.notice_id).collect())
    })
}

fn extract_string(doc: &Value, field: &str) -> Option<String> {
    doc.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Integer ids may arrive as numbers or numeric strings; zero is invalid
fn extract_u64(doc: &Value, field: &str) -> Option<u64> {
    let id = match doc.get(field)? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    (id != 0).then_some(id)
}
