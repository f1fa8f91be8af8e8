//! Queue entry records and their persistence contract.
use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QueueError;

/// Lifecycle step a queued entry resumes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperation {
    Sign,
    Submit,
    CheckStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl EntryState {
    /// Pending and syncing entries still represent undelivered work.
    pub fn is_live(&self) -> bool {
        matches!(self, EntryState::Pending | EntryState::Syncing)
    }
}

/// One document awaiting a retried operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Assigned by the store on insert.
    pub id: u64,
    pub document_id: u64,
    pub operation: QueueOperation,
    /// Cached signed body, when the failed step already produced one.
    pub signed_body: Option<String>,
    pub priority: QueuePriority,
    pub state: EntryState,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_retry: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(
        document_id: u64,
        operation: QueueOperation,
        priority: QueuePriority,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            document_id,
            operation,
            signed_body: None,
            priority,
            state: EntryState::Pending,
            retry_count: 0,
            last_attempt: None,
            next_retry: None,
            last_error: None,
            created_at,
            synced_at: None,
        }
    }

    /// Pending and past its backoff.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Pending && self.next_retry.map_or(true, |at| at <= now)
    }
}

/// Persistence for queue entries.
///
/// `begin_sync` and `remove` must be atomic with respect to each other: an entry in
/// `Syncing` is owned by exactly one attempt and cannot be removed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Store a new entry and return it with its assigned id.
    async fn insert(&self, entry: QueueEntry) -> Result<QueueEntry, QueueError>;

    async fn get(&self, id: u64) -> Result<Option<QueueEntry>, QueueError>;

    /// Overwrite an existing entry.
    async fn update(&self, entry: &QueueEntry) -> Result<(), QueueError>;

    async fn list(&self) -> Result<Vec<QueueEntry>, QueueError>;

    /// The pending or syncing entry for a document, if any.
    async fn find_live(&self, document_id: u64) -> Result<Option<QueueEntry>, QueueError>;

    /// Move the entry from `expected` to `Syncing`. Returns `None` when its state differs.
    async fn begin_sync(
        &self,
        id: u64,
        expected: EntryState,
    ) -> Result<Option<QueueEntry>, QueueError>;

    /// Delete an entry. Fails with [`QueueError::AlreadySyncing`] while it is syncing.
    async fn remove(&self, id: u64) -> Result<QueueEntry, QueueError>;
}

#[derive(Debug, Default)]
struct Table {
    next_id: u64,
    rows: BTreeMap<u64, QueueEntry>,
}

/// Process-local store, suitable for a single worker and for tests.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    table: Mutex<Table>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, mut entry: QueueEntry) -> Result<QueueEntry, QueueError> {
        let mut table = self.table();
        table.next_id += 1;
        entry.id = table.next_id;
        table.rows.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: u64) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.table().rows.get(&id).cloned())
    }

    async fn update(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        match self.table().rows.get_mut(&entry.id) {
            Some(row) => {
                *row = entry.clone();
                Ok(())
            }
            None => Err(QueueError::NotFound(entry.id)),
        }
    }

    async fn list(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.table().rows.values().cloned().collect())
    }

    async fn find_live(&self, document_id: u64) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self
            .table()
            .rows
            .values()
            .find(|entry| entry.document_id == document_id && entry.state.is_live())
            .cloned())
    }

    async fn begin_sync(
        &self,
        id: u64,
        expected: EntryState,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let mut table = self.table();
        let row = table.rows.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if row.state != expected {
            return Ok(None);
        }
        row.state = EntryState::Syncing;
        Ok(Some(row.clone()))
    }

    async fn remove(&self, id: u64) -> Result<QueueEntry, QueueError> {
        let mut table = self.table();
        match table.rows.get(&id).map(|entry| entry.state) {
            None => Err(QueueError::NotFound(id)),
            Some(EntryState::Syncing) => Err(QueueError::AlreadySyncing(id)),
            Some(_) => table.rows.remove(&id).ok_or(QueueError::NotFound(id)),
        }
    }
}
