//! Document persistence contract.
use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use thiserror::Error;

use super::{DocumentState, ElectronicDocument};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Document {0} not found")]
    NotFound(u64),
    #[error("Document storage error: {0}")]
    Storage(String),
}

/// Documents are inserted and updated, never deleted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Store a new document and return it with its assigned id.
    async fn insert(&self, document: ElectronicDocument)
        -> Result<ElectronicDocument, RepositoryError>;

    async fn get(&self, id: u64) -> Result<Option<ElectronicDocument>, RepositoryError>;

    async fn update(&self, document: &ElectronicDocument) -> Result<(), RepositoryError>;

    /// Oldest first.
    async fn find_by_state(
        &self,
        state: DocumentState,
        limit: usize,
    ) -> Result<Vec<ElectronicDocument>, RepositoryError>;
}

#[derive(Debug, Default)]
struct Rows {
    next_id: u64,
    documents: BTreeMap<u64, ElectronicDocument>,
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentRepository {
    rows: Mutex<Rows>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, Rows> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn insert(
        &self,
        mut document: ElectronicDocument,
    ) -> Result<ElectronicDocument, RepositoryError> {
        let mut rows = self.rows();
        rows.next_id += 1;
        document.set_id(rows.next_id);
        rows.documents.insert(document.id(), document.clone());
        Ok(document)
    }

    async fn get(&self, id: u64) -> Result<Option<ElectronicDocument>, RepositoryError> {
        Ok(self.rows().documents.get(&id).cloned())
    }

    async fn update(&self, document: &ElectronicDocument) -> Result<(), RepositoryError> {
        match self.rows().documents.get_mut(&document.id()) {
            Some(stored) => {
                *stored = document.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(document.id())),
        }
    }

    async fn find_by_state(
        &self,
        state: DocumentState,
        limit: usize,
    ) -> Result<Vec<ElectronicDocument>, RepositoryError> {
        let mut found: Vec<ElectronicDocument> = self
            .rows()
            .documents
            .values()
            .filter(|document| document.state() == state)
            .cloned()
            .collect();
        found.sort_by_key(|document| (document.updated_at(), document.id()));
        found.truncate(limit);
        Ok(found)
    }
}
