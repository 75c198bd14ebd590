//! redb-based store with a built-in change feed
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | one per collection | record key | JSON document | Scheduling records |
//! | `changes` | `(collection, sequence)` | JSON `StoredChange` | Change journal, trimmed by [`RedbStore::compact_journal`] |
//! | `sequence_counter` | `"change_seq"` | `u64` | Global change sequence |
//! | `resume_tokens` | token key | JSON `ResumeTokenRecord` | Informer watch positions |
//! | `delivered_cores` | biz id | `i64` | Rolling delivered-core quota counter |
//!
//! Every document write appends to the journal in the same transaction and is
//! then published on a broadcast channel. A watcher replays the journal after
//! its start token and then follows the broadcast, so resuming from any issued
//! token loses nothing that was committed.

use super::error::{StorageError, StorageResult};
use super::{ChangeEvent, ChangeFeed, OperationType, OrderStatusUpdate, Store, WatchStart, collection};
use crate::informer::{ResumeTokenRecord, ResumeTokenStore, TokenPatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::models::{
    ApplyOrder, ApplyStage, ApplyStatus, ApplyTicket, DeliverRecord, DeviceInfo, GenerateRecord,
    GenerateStatus, InitRecord, Notice, OrderStep, StepName, StepStatus,
};
use shared::AppResult;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Change journal: key = (collection, sequence), value = JSON-serialized StoredChange
const CHANGES_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("changes");

/// Global change sequence, doubles as the resume token
const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequence_counter");

const RESUME_TOKENS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("resume_tokens");

const DELIVERED_CORES_TABLE: TableDefinition<&str, i64> = TableDefinition::new("delivered_cores");

const SEQUENCE_KEY: &str = "change_seq";

const COLLECTIONS: [&str; 8] = [
    collection::APPLY_ORDER,
    collection::APPLY_TICKET,
    collection::GENERATE_RECORD,
    collection::DEVICE_INFO,
    collection::INIT_RECORD,
    collection::DELIVER_RECORD,
    collection::ORDER_STEP,
    collection::NOTICE,
];

/// Broadcast capacity; a watcher further behind than this is dropped and resubscribes
const FEED_CAPACITY: usize = 1024;
/// Per-subscription buffer
const WATCH_BUFFER: usize = 256;

fn doc_table(name: &'static str) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

fn encode_token(seq: u64) -> String {
    format!("{seq:020}")
}

fn decode_token(token: &str) -> StorageResult<u64> {
    token
        .parse::<u64>()
        .map_err(|_| StorageError::InvalidToken(token.to_string()))
}

/// Journal entry as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChange {
    operation: OperationType,
    document: serde_json::Value,
    event_id: String,
    cursor: i64,
}

#[derive(Debug, Clone)]
struct FeedEntry {
    seq: u64,
    event: ChangeEvent,
}

impl StoredChange {
    fn into_entry(self, collection: &str, seq: u64) -> StorageResult<FeedEntry> {
        Ok(FeedEntry {
            seq,
            event: ChangeEvent {
                collection: collection.to_string(),
                operation: self.operation,
                document: serde_json::to_vec(&self.document)?,
                token: encode_token(seq),
                event_id: self.event_id,
                cursor: Some(self.cursor),
            },
        })
    }
}

/// Scheduler store backed by redb
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    feed: broadcast::Sender<FeedEntry>,
    /// Serializes commit + publish so the broadcast order matches the journal
    write_lock: Arc<Mutex<()>>,
}

impl RedbStore {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (tests, dry runs)
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            for name in COLLECTIONS {
                let _ = write_txn.open_table(doc_table(name))?;
            }
            let _ = write_txn.open_table(CHANGES_TABLE)?;
            let _ = write_txn.open_table(RESUME_TOKENS_TABLE)?;
            let _ = write_txn.open_table(DELIVERED_CORES_TABLE)?;

            let mut seq_table = write_txn.open_table(SEQUENCE_TABLE)?;
            if seq_table.get(SEQUENCE_KEY)?.is_none() {
                seq_table.insert(SEQUENCE_KEY, 0u64)?;
            }
        }
        write_txn.commit()?;

        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self {
            db: Arc::new(db),
            feed,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    // ========== Generic document helpers ==========

    fn get_doc<T: DeserializeOwned>(
        &self,
        collection: &'static str,
        key: &str,
    ) -> StorageResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(doc_table(collection))?;
        match table.get(key)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn require_doc<T: DeserializeOwned>(
        &self,
        collection: &'static str,
        key: &str,
    ) -> StorageResult<T> {
        self.get_doc(collection, key)?
            .ok_or_else(|| StorageError::NotFound {
                collection,
                key: key.to_string(),
            })
    }

    fn scan_docs<T, F>(&self, collection: &'static str, filter: F) -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(doc_table(collection))?;
        let mut out = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            let doc: T = serde_json::from_slice(value.value())?;
            if filter(&doc) {
                out.push(doc);
            }
        }
        Ok(out)
    }

    /// Read-modify-write one document and journal the change
    ///
    /// `f` receives the stored document (if any) and returns the new one, or
    /// `None` to leave it untouched. Returns whether anything was written.
    fn write_doc<T, F>(&self, collection: &'static str, key: &str, f: F) -> StorageResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StorageResult<Option<T>>,
    {
        let _guard = self.write_lock.lock();
        let txn = self.db.begin_write()?;
        let (operation, value) = {
            let mut table = txn.open_table(doc_table(collection))?;
            let existing: Option<T> = match table.get(key)? {
                Some(guard) => Some(serde_json::from_slice(guard.value())?),
                None => None,
            };
            let operation = if existing.is_some() {
                OperationType::Update
            } else {
                OperationType::Insert
            };
            let Some(doc) = f(existing)? else {
                return Ok(false);
            };
            let value = serde_json::to_vec(&doc)?;
            table.insert(key, value.as_slice())?;
            (operation, value)
        };
        let entry = Self::append_change(&txn, collection, operation, &value)?;
        txn.commit()?;
        // No receivers is fine
        let _ = self.feed.send(entry);
        Ok(true)
    }

    fn put_doc<T: Serialize + DeserializeOwned>(
        &self,
        collection: &'static str,
        key: &str,
        doc: T,
    ) -> StorageResult<()> {
        self.write_doc(collection, key, |_: Option<T>| Ok(Some(doc)))?;
        Ok(())
    }

    /// Update an existing document; `f` returning false skips the write
    fn modify_doc_if<T, F>(&self, collection: &'static str, key: &str, f: F) -> StorageResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        self.write_doc(collection, key, |existing: Option<T>| {
            let mut doc = existing.ok_or_else(|| StorageError::NotFound {
                collection,
                key: key.to_string(),
            })?;
            Ok(f(&mut doc).then_some(doc))
        })
    }

    fn modify_doc<T, F>(&self, collection: &'static str, key: &str, f: F) -> StorageResult<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        self.modify_doc_if(collection, key, |doc: &mut T| {
            f(doc);
            true
        })?;
        Ok(())
    }

    /// Remove a document and journal a delete event, returns whether it existed
    pub fn delete_document(&self, collection: &'static str, key: &str) -> StorageResult<bool> {
        let _guard = self.write_lock.lock();
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(doc_table(collection))?;
            table.remove(key)?.map(|guard| guard.value().to_vec())
        };
        let Some(value) = removed else {
            return Ok(false);
        };
        let entry = Self::append_change(&txn, collection, OperationType::Delete, &value)?;
        txn.commit()?;
        let _ = self.feed.send(entry);
        Ok(true)
    }

    fn append_change(
        txn: &WriteTransaction,
        collection: &'static str,
        operation: OperationType,
        value: &[u8],
    ) -> StorageResult<FeedEntry> {
        let seq = {
            let mut seq_table = txn.open_table(SEQUENCE_TABLE)?;
            let next = seq_table
                .get(SEQUENCE_KEY)?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            seq_table.insert(SEQUENCE_KEY, next)?;
            next
        };

        let stored = StoredChange {
            operation,
            document: serde_json::from_slice(value)?,
            event_id: uuid::Uuid::new_v4().to_string(),
            cursor: shared::util::now_millis(),
        };
        let mut changes = txn.open_table(CHANGES_TABLE)?;
        let bytes = serde_json::to_vec(&stored)?;
        changes.insert((collection, seq), bytes.as_slice())?;
        stored.into_entry(collection, seq)
    }

    fn current_sequence(&self) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SEQUENCE_TABLE)?;
        Ok(table
            .get(SEQUENCE_KEY)?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    fn changes_after(&self, collection: &str, after: u64) -> StorageResult<Vec<FeedEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHANGES_TABLE)?;

        let mut entries = Vec::new();
        let range_start = (collection, after.saturating_add(1));
        let range_end = (collection, u64::MAX);
        for result in table.range(range_start..=range_end)? {
            let (key, value) = result?;
            let (_, seq) = key.value();
            let stored: StoredChange = serde_json::from_slice(value.value())?;
            entries.push(stored.into_entry(collection, seq)?);
        }
        Ok(entries)
    }

    fn last_change_seq(&self, collection: &str) -> StorageResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHANGES_TABLE)?;
        let range_start = (collection, 0u64);
        let range_end = (collection, u64::MAX);
        match table.range(range_start..=range_end)?.next_back() {
            Some(result) => {
                let (key, _value) = result?;
                Ok(Some(key.value().1))
            }
            None => Ok(None),
        }
    }

    // ========== Journal compaction ==========

    fn read_token(&self, key: &str) -> StorageResult<Option<ResumeTokenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RESUME_TOKENS_TABLE)?;
        match table.get(key)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Drop journal entries of one collection at or below `up_to`
    ///
    /// The newest entry always survives so `latest_token` keeps resolving.
    /// Returns the number of removed entries.
    pub fn compact_changes(&self, collection: &str, up_to: u64) -> StorageResult<usize> {
        let _guard = self.write_lock.lock();
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(CHANGES_TABLE)?;
            let newest = match table.range((collection, 0u64)..=(collection, u64::MAX))?.next_back() {
                Some(result) => {
                    let (key, _value) = result?;
                    key.value().1
                }
                None => return Ok(0),
            };
            let limit = up_to.min(newest.saturating_sub(1));
            let mut seqs = Vec::new();
            for result in table.range((collection, 0u64)..=(collection, limit))? {
                let (key, _value) = result?;
                seqs.push(key.value().1);
            }
            for seq in &seqs {
                table.remove((collection, *seq))?;
            }
            seqs.len()
        };
        if removed == 0 {
            return Ok(0);
        }
        txn.commit()?;
        Ok(removed)
    }

    /// Trim the journal of every collection
    ///
    /// `watched` pairs a collection with its resume-token key. A watched
    /// collection is trimmed up to its persisted token and left alone while it
    /// has none; collections nobody watches keep only their newest entry.
    pub fn compact_journal(&self, watched: &[(&str, &str)]) -> StorageResult<usize> {
        let mut removed = 0;
        for name in COLLECTIONS {
            let up_to = match watched.iter().find(|(collection, _)| *collection == name) {
                Some((_, token_key)) => {
                    let token = self.read_token(token_key)?.and_then(|record| record.token);
                    match token.as_deref().map(decode_token) {
                        Some(Ok(seq)) => seq,
                        Some(Err(e)) => {
                            tracing::warn!(collection = name, error = %e, "Skipping journal compaction");
                            continue;
                        }
                        None => continue,
                    }
                }
                None => u64::MAX,
            };
            removed += self.compact_changes(name, up_to)?;
        }
        Ok(removed)
    }
}

// ========== Change feed ==========

#[async_trait]
impl ChangeFeed for RedbStore {
    async fn watch(
        &self,
        collection: &str,
        start: WatchStart,
    ) -> AppResult<mpsc::Receiver<ChangeEvent>> {
        // Subscribe before reading the journal so nothing committed in between is missed
        let mut live = self.feed.subscribe();
        let after = match &start {
            WatchStart::Token(token) => decode_token(token)?,
            WatchStart::Now => self.current_sequence()?,
        };
        let backlog = self.changes_after(collection, after)?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let collection = collection.to_string();
        tokio::spawn(async move {
            let mut last = after;
            for entry in backlog {
                last = entry.seq;
                if tx.send(entry.event).await.is_err() {
                    return;
                }
            }

            loop {
                let received = tokio::select! {
                    _ = tx.closed() => return,
                    received = live.recv() => received,
                };
                match received {
                    Ok(entry) => {
                        if entry.event.collection != collection || entry.seq <= last {
                            continue;
                        }
                        last = entry.seq;
                        if tx.send(entry.event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            collection = %collection,
                            skipped,
                            "Change feed subscriber lagged, closing subscription"
                        );
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn latest_token(&self, collection: &str) -> AppResult<Option<String>> {
        Ok(self.last_change_seq(collection)?.map(encode_token))
    }
}

// ========== Resume tokens ==========

#[async_trait]
impl ResumeTokenStore for RedbStore {
    async fn get_token(&self, key: &str) -> AppResult<Option<ResumeTokenRecord>> {
        Ok(self.read_token(key)?)
    }

    async fn merge_token(&self, key: &str, patch: &TokenPatch) -> AppResult<()> {
        let txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut table = txn
                .open_table(RESUME_TOKENS_TABLE)
                .map_err(StorageError::from)?;
            let mut record: ResumeTokenRecord = match table.get(key).map_err(StorageError::from)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => ResumeTokenRecord {
                    id: key.to_string(),
                    ..Default::default()
                },
            };
            if !record.merge(patch) {
                return Ok(());
            }
            record.updated_at = shared::util::now_millis();
            let bytes = serde_json::to_vec(&record)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(StorageError::from)?;
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(())
    }
}

// ========== Scheduling records ==========

fn step_key(sub_order_id: &str, step: StepName) -> String {
    format!("{}:{}", sub_order_id, step.as_str())
}

#[async_trait]
impl Store for RedbStore {
    async fn get_apply_order(&self, sub_order_id: &str) -> AppResult<ApplyOrder> {
        Ok(self.require_doc(collection::APPLY_ORDER, sub_order_id)?)
    }

    async fn find_apply_orders(&self, statuses: &[ApplyStatus]) -> AppResult<Vec<ApplyOrder>> {
        Ok(self.scan_docs(collection::APPLY_ORDER, |o: &ApplyOrder| {
            statuses.contains(&o.status)
        })?)
    }

    async fn find_apply_orders_by_ticket(&self, order_id: u64) -> AppResult<Vec<ApplyOrder>> {
        Ok(self.scan_docs(collection::APPLY_ORDER, |o: &ApplyOrder| {
            o.order_id == order_id
        })?)
    }

    async fn upsert_apply_order(&self, order: &ApplyOrder) -> AppResult<()> {
        Ok(self.put_doc(collection::APPLY_ORDER, &order.sub_order_id, order.clone())?)
    }

    async fn update_apply_order_status(
        &self,
        sub_order_id: &str,
        update: &OrderStatusUpdate,
    ) -> AppResult<bool> {
        Ok(self.modify_doc_if(collection::APPLY_ORDER, sub_order_id, |o: &mut ApplyOrder| {
            if o.status != update.from_status || o.delivered_core != update.from_core {
                return false;
            }
            o.status = update.status;
            o.stage = update.stage;
            if let Some(core) = update.delivered_core {
                o.delivered_core = core;
            }
            o.updated_at = shared::util::now_millis();
            true
        })?)
    }

    async fn get_ticket(&self, order_id: u64) -> AppResult<ApplyTicket> {
        Ok(self.require_doc(collection::APPLY_TICKET, &order_id.to_string())?)
    }

    async fn find_running_tickets(&self) -> AppResult<Vec<ApplyTicket>> {
        Ok(self.scan_docs(collection::APPLY_TICKET, |t: &ApplyTicket| {
            t.stage == ApplyStage::Running
        })?)
    }

    async fn upsert_ticket(&self, ticket: &ApplyTicket) -> AppResult<()> {
        Ok(self.put_doc(
            collection::APPLY_TICKET,
            &ticket.order_id.to_string(),
            ticket.clone(),
        )?)
    }

    async fn update_ticket_stage(&self, order_id: u64, stage: ApplyStage) -> AppResult<()> {
        Ok(self.modify_doc(
            collection::APPLY_TICKET,
            &order_id.to_string(),
            |t: &mut ApplyTicket| {
                t.stage = stage;
                t.updated_at = shared::util::now_millis();
            },
        )?)
    }

    async fn get_generate_record(&self, generate_id: u64) -> AppResult<GenerateRecord> {
        Ok(self.require_doc(collection::GENERATE_RECORD, &generate_id.to_string())?)
    }

    async fn find_generate_records_by_order(
        &self,
        sub_order_id: &str,
    ) -> AppResult<Vec<GenerateRecord>> {
        Ok(self.scan_docs(collection::GENERATE_RECORD, |r: &GenerateRecord| {
            r.sub_order_id == sub_order_id
        })?)
    }

    async fn find_pending_generate_records(&self) -> AppResult<Vec<GenerateRecord>> {
        Ok(self.scan_docs(collection::GENERATE_RECORD, |r: &GenerateRecord| {
            r.is_in_flight()
        })?)
    }

    async fn upsert_generate_record(&self, record: &GenerateRecord) -> AppResult<()> {
        Ok(self.put_doc(
            collection::GENERATE_RECORD,
            &record.generate_id.to_string(),
            record.clone(),
        )?)
    }

    async fn mark_generate_matched(&self, generate_id: u64) -> AppResult<()> {
        Ok(self.modify_doc(
            collection::GENERATE_RECORD,
            &generate_id.to_string(),
            |r: &mut GenerateRecord| {
                r.is_matched = true;
                r.updated_at = shared::util::now_millis();
            },
        )?)
    }

    async fn update_generate_status(
        &self,
        generate_id: u64,
        status: GenerateStatus,
        message: &str,
    ) -> AppResult<()> {
        Ok(self.modify_doc(
            collection::GENERATE_RECORD,
            &generate_id.to_string(),
            |r: &mut GenerateRecord| {
                r.status = status;
                r.message = message.to_string();
                r.updated_at = shared::util::now_millis();
            },
        )?)
    }

    async fn find_devices_by_generate(&self, generate_id: u64) -> AppResult<Vec<DeviceInfo>> {
        Ok(self.scan_docs(collection::DEVICE_INFO, |d: &DeviceInfo| {
            d.generate_id == generate_id
        })?)
    }

    async fn find_devices_by_order(&self, sub_order_id: &str) -> AppResult<Vec<DeviceInfo>> {
        Ok(self.scan_docs(collection::DEVICE_INFO, |d: &DeviceInfo| {
            d.sub_order_id == sub_order_id
        })?)
    }

    async fn upsert_device(&self, device: &DeviceInfo) -> AppResult<()> {
        let mut device = device.clone();
        self.write_doc(
            collection::DEVICE_INFO,
            &device.id.to_string(),
            |existing: Option<DeviceInfo>| {
                if let Some(stored) = existing {
                    device.merge_flags(&stored);
                }
                device.updated_at = shared::util::now_millis();
                Ok(Some(device))
            },
        )?;
        Ok(())
    }

    async fn insert_init_record(&self, record: &InitRecord) -> AppResult<()> {
        Ok(self.put_doc(collection::INIT_RECORD, &record.id, record.clone())?)
    }

    async fn update_init_record(&self, record: &InitRecord) -> AppResult<()> {
        let mut record = record.clone();
        record.updated_at = shared::util::now_millis();
        Ok(self.put_doc(collection::INIT_RECORD, &record.id.clone(), record)?)
    }

    async fn insert_deliver_record(&self, record: &DeliverRecord) -> AppResult<()> {
        Ok(self.put_doc(collection::DELIVER_RECORD, &record.id, record.clone())?)
    }

    async fn update_deliver_record(&self, record: &DeliverRecord) -> AppResult<()> {
        let mut record = record.clone();
        record.updated_at = shared::util::now_millis();
        Ok(self.put_doc(collection::DELIVER_RECORD, &record.id.clone(), record)?)
    }

    async fn update_step(
        &self,
        sub_order_id: &str,
        step: StepName,
        status: StepStatus,
        message: &str,
    ) -> AppResult<()> {
        Ok(self.put_doc(
            collection::ORDER_STEP,
            &step_key(sub_order_id, step),
            OrderStep {
                sub_order_id: sub_order_id.to_string(),
                step,
                status,
                message: message.to_string(),
                updated_at: shared::util::now_millis(),
            },
        )?)
    }

    async fn get_step(&self, sub_order_id: &str, step: StepName) -> AppResult<Option<OrderStep>> {
        Ok(self.get_doc(collection::ORDER_STEP, &step_key(sub_order_id, step))?)
    }

    async fn add_delivered_cores(&self, biz_id: i64, delta: i64) -> AppResult<i64> {
        let key = biz_id.to_string();
        let txn = self.db.begin_write().map_err(StorageError::from)?;
        let total = {
            let mut table = txn
                .open_table(DELIVERED_CORES_TABLE)
                .map_err(StorageError::from)?;
            let current = table
                .get(key.as_str())
                .map_err(StorageError::from)?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let total = current + delta;
            table
                .insert(key.as_str(), total)
                .map_err(StorageError::from)?;
            total
        };
        txn.commit().map_err(StorageError::from)?;
        Ok(total)
    }

    async fn get_notice(&self, notice_id: u64) -> AppResult<Notice> {
        Ok(self.require_doc(collection::NOTICE, &notice_id.to_string())?)
    }

    async fn find_unsent_notices(&self) -> AppResult<Vec<Notice>> {
        Ok(self.scan_docs(collection::NOTICE, |n: &Notice| !n.sent)?)
    }

    async fn upsert_notice(&self, notice: &Notice) -> AppResult<()> {
        Ok(self.put_doc(
            collection::NOTICE,
            &notice.notice_id.to_string(),
            notice.clone(),
        )?)
    }

    async fn mark_notice_sent(&self, notice_id: u64) -> AppResult<()> {
        Ok(self.modify_doc(collection::NOTICE, &notice_id.to_string(), |n: &mut Notice| {
            n.sent = true;
            n.updated_at = shared::util::now_millis();
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::ResourceType;
    use std::time::Duration;

    fn order(sub_order_id: &str, status: ApplyStatus) -> ApplyOrder {
        let mut o = ApplyOrder::new(sub_order_id, 1, 100, "alice", 2, ResourceType::Cvm);
        o.status = status;
        o
    }

    async fn next_event(rx: &mut mpsc::Receiver<ChangeEvent>) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for change event")
            .expect("change feed closed")
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = RedbStore::open_in_memory().unwrap();
        let err = store.get_apply_order("missing").await.unwrap_err();
        assert!(err.is_not_found());

        let err = store.mark_generate_matched(42).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_orders_by_status() {
        let store = RedbStore::open_in_memory().unwrap();
        store.upsert_apply_order(&order("a", ApplyStatus::WaitForMatch)).await.unwrap();
        store.upsert_apply_order(&order("b", ApplyStatus::Done)).await.unwrap();
        store.upsert_apply_order(&order("c", ApplyStatus::MatchedSome)).await.unwrap();

        let mut active = store.find_apply_orders(&ApplyStatus::ACTIVE).await.unwrap();
        active.sort_by(|x, y| x.sub_order_id.cmp(&y.sub_order_id));
        let ids: Vec<_> = active.iter().map(|o| o.sub_order_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_device_flags_survive_stale_writes() {
        let store = RedbStore::open_in_memory().unwrap();
        let mut device = DeviceInfo::new(9, "so-1", 1, "10.0.0.9");
        store.upsert_device(&device).await.unwrap();

        device.is_inited = true;
        device.is_delivered = true;
        store.upsert_device(&device).await.unwrap();

        // A writer holding an older copy must not reset the flags
        let stale = DeviceInfo::new(9, "so-1", 1, "10.0.0.9");
        store.upsert_device(&stale).await.unwrap();

        let stored = store.find_devices_by_generate(1).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_inited);
        assert!(stored[0].is_delivered);
        assert!(!stored[0].is_disk_checked);
    }

    #[tokio::test]
    async fn test_watch_from_now_sees_only_new_changes() {
        let store = RedbStore::open_in_memory().unwrap();
        store.upsert_apply_order(&order("old", ApplyStatus::Matching)).await.unwrap();

        let mut rx = store.watch(collection::APPLY_ORDER, WatchStart::Now).await.unwrap();
        store.upsert_apply_order(&order("new", ApplyStatus::Matching)).await.unwrap();
        // Other collections are filtered out
        store.upsert_notice(&Notice::new(1, "bob", "x")).await.unwrap();
        store
            .update_apply_order_status(
                "new",
                &OrderStatusUpdate {
                    from_status: ApplyStatus::Matching,
                    from_core: 0,
                    status: ApplyStatus::Done,
                    stage: ApplyStage::Done,
                    delivered_core: None,
                },
            )
            .await
            .unwrap();

        let first = next_event(&mut rx).await;
        assert_eq!(first.operation, OperationType::Insert);
        let doc: ApplyOrder = serde_json::from_slice(&first.document).unwrap();
        assert_eq!(doc.sub_order_id, "new");

        let second = next_event(&mut rx).await;
        assert_eq!(second.operation, OperationType::Update);
        assert!(second.token > first.token);
        assert!(second.cursor.is_some());
    }

    #[tokio::test]
    async fn test_watch_resumes_after_token() {
        let store = RedbStore::open_in_memory().unwrap();
        store.upsert_apply_order(&order("a", ApplyStatus::Matching)).await.unwrap();
        let after_a = store.latest_token(collection::APPLY_ORDER).await.unwrap().unwrap();
        store.upsert_apply_order(&order("b", ApplyStatus::Matching)).await.unwrap();
        store.upsert_apply_order(&order("c", ApplyStatus::Matching)).await.unwrap();

        let mut rx = store
            .watch(collection::APPLY_ORDER, WatchStart::Token(after_a))
            .await
            .unwrap();
        let b: ApplyOrder = serde_json::from_slice(&next_event(&mut rx).await.document).unwrap();
        let c: ApplyOrder = serde_json::from_slice(&next_event(&mut rx).await.document).unwrap();
        assert_eq!(b.sub_order_id, "b");
        assert_eq!(c.sub_order_id, "c");
    }

    #[tokio::test]
    async fn test_status_update_is_compare_and_set() {
        let store = RedbStore::open_in_memory().unwrap();
        store.upsert_apply_order(&order("so", ApplyStatus::Matching)).await.unwrap();
        let update = OrderStatusUpdate {
            from_status: ApplyStatus::Matching,
            from_core: 0,
            status: ApplyStatus::Done,
            stage: ApplyStage::Done,
            delivered_core: Some(8),
        };

        assert!(store.update_apply_order_status("so", &update).await.unwrap());
        let token = store.latest_token(collection::APPLY_ORDER).await.unwrap();

        // A second writer computed from the same Matching copy loses
        assert!(!store.update_apply_order_status("so", &update).await.unwrap());
        assert_eq!(store.latest_token(collection::APPLY_ORDER).await.unwrap(), token);

        let stored = store.get_apply_order("so").await.unwrap();
        assert_eq!(stored.status, ApplyStatus::Done);
        assert_eq!(stored.delivered_core, 8);
    }

    #[tokio::test]
    async fn test_compaction_keeps_resume_from_token() {
        let store = RedbStore::open_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            store.upsert_apply_order(&order(id, ApplyStatus::Matching)).await.unwrap();
        }
        let applied = store.latest_token(collection::APPLY_ORDER).await.unwrap().unwrap();
        store
            .merge_token(
                "apply_order",
                &TokenPatch {
                    token: Some(applied.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.upsert_apply_order(&order("d", ApplyStatus::Matching)).await.unwrap();
        store.upsert_device(&DeviceInfo::new(1, "d", 1, "10.0.0.1")).await.unwrap();
        store.upsert_device(&DeviceInfo::new(2, "d", 1, "10.0.0.2")).await.unwrap();

        let removed = store
            .compact_journal(&[(collection::APPLY_ORDER, "apply_order")])
            .unwrap();
        // a, b, c of the orders; the older device write
        assert_eq!(removed, 4);
        assert_eq!(store.changes_after(collection::APPLY_ORDER, 0).unwrap().len(), 1);
        assert!(store.latest_token(collection::DEVICE_INFO).await.unwrap().is_some());

        let mut rx = store
            .watch(collection::APPLY_ORDER, WatchStart::Token(applied))
            .await
            .unwrap();
        let d: ApplyOrder = serde_json::from_slice(&next_event(&mut rx).await.document).unwrap();
        assert_eq!(d.sub_order_id, "d");

        // Nothing newer than the persisted token: the newest entry still survives
        assert_eq!(store.compact_journal(&[(collection::APPLY_ORDER, "apply_order")]).unwrap(), 0);
        assert!(store.latest_token(collection::APPLY_ORDER).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watched_collection_without_token_is_not_compacted() {
        let store = RedbStore::open_in_memory().unwrap();
        store.upsert_notice(&Notice::new(1, "bob", "x")).await.unwrap();
        store.upsert_notice(&Notice::new(2, "bob", "y")).await.unwrap();

        assert_eq!(store.compact_journal(&[(collection::NOTICE, "notice")]).unwrap(), 0);
        assert_eq!(store.changes_after(collection::NOTICE, 0).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_is_journaled() {
        let store = RedbStore::open_in_memory().unwrap();
        store.upsert_notice(&Notice::new(5, "bob", "x")).await.unwrap();
        let mut rx = store.watch(collection::NOTICE, WatchStart::Now).await.unwrap();

        assert!(store.delete_document(collection::NOTICE, "5").unwrap());
        assert!(!store.delete_document(collection::NOTICE, "5").unwrap());

        let event = next_event(&mut rx).await;
        assert_eq!(event.operation, OperationType::Delete);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let store = RedbStore::open_in_memory().unwrap();
        let err = store
            .watch(collection::NOTICE, WatchStart::Token("not-a-token".into()))
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_merge_token_keeps_unrelated_fields() {
        let store = RedbStore::open_in_memory().unwrap();
        store
            .merge_token(
                "apply_order",
                &TokenPatch {
                    token: Some("00000000000000000003".into()),
                    cursor: Some(100),
                    event_id: Some("e3".into()),
                },
            )
            .await
            .unwrap();
        store
            .merge_token(
                "apply_order",
                &TokenPatch {
                    token: Some("00000000000000000004".into()),
                    cursor: None,
                    event_id: None,
                },
            )
            .await
            .unwrap();

        let record = store.get_token("apply_order").await.unwrap().unwrap();
        assert_eq!(record.id, "apply_order");
        assert_eq!(record.token.as_deref(), Some("00000000000000000004"));
        assert_eq!(record.cursor, Some(100));
        assert_eq!(record.event_id.as_deref(), Some("e3"));
    }

    #[tokio::test]
    async fn test_delivered_cores_accumulate() {
        let store = RedbStore::open_in_memory().unwrap();
        assert_eq!(store.add_delivered_cores(7, 16).await.unwrap(), 16);
        assert_eq!(store.add_delivered_cores(7, 8).await.unwrap(), 24);
        assert_eq!(store.add_delivered_cores(8, 4).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.upsert_apply_order(&order("persisted", ApplyStatus::Matching)).await.unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let o = store.get_apply_order("persisted").await.unwrap();
        assert_eq!(o.status, ApplyStatus::Matching);
        assert!(store.latest_token(collection::APPLY_ORDER).await.unwrap().is_some());
    }
}
