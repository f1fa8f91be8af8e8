//! Persistence for the shared bucket record.
//!
//! A store hands out a guard per bucket key. Holding the guard is the mutual-exclusion
//! scope: every reader and writer of that key waits until the guard is dropped.
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use super::RateLimitError;

/// The persisted bucket record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
    pub lifetime_requests: u64,
}

impl BucketState {
    pub fn full(capacity: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            lifetime_requests: 0,
        }
    }
}

/// Exclusive access to one bucket record. The lock is released when the guard drops.
pub trait BucketGuard: Send {
    fn load(&mut self) -> Result<Option<BucketState>, RateLimitError>;
    fn store(&mut self, state: &BucketState) -> Result<(), RateLimitError>;
}

/// Keyed bucket persistence with a per-key lock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn lock(&self, key: &str) -> Result<Box<dyn BucketGuard>, RateLimitError>;
}

type Slot = Arc<AsyncMutex<Option<BucketState>>>;

/// Single-process store; buckets live as long as the store.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

struct MemoryGuard(OwnedMutexGuard<Option<BucketState>>);

impl BucketGuard for MemoryGuard {
    fn load(&mut self) -> Result<Option<BucketState>, RateLimitError> {
        Ok(self.0.clone())
    }

    fn store(&mut self, state: &BucketState) -> Result<(), RateLimitError> {
        *self.0 = Some(state.clone());
        Ok(())
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn lock(&self, key: &str) -> Result<Box<dyn BucketGuard>, RateLimitError> {
        let guard = self.slot(key).lock_owned().await;
        Ok(Box::new(MemoryGuard(guard)))
    }
}

/// Cross-process store: one JSON file per bucket key, guarded by an exclusive `flock`.
#[derive(Debug, Clone)]
pub struct FileBucketStore {
    dir: PathBuf,
}

impl FileBucketStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.bucket.json"))
    }

    fn open_locked(path: &Path) -> Result<File, RateLimitError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| storage(path, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| storage(path, e))?;
        file.lock_exclusive().map_err(|e| storage(path, e))?;
        Ok(file)
    }
}

fn storage(path: &Path, err: impl std::fmt::Display) -> RateLimitError {
    RateLimitError::Storage(format!("{}: {err}", path.display()))
}

struct FileGuard {
    file: File,
    path: PathBuf,
}

impl BucketGuard for FileGuard {
    fn load(&mut self) -> Result<Option<BucketState>, RateLimitError> {
        let mut raw = String::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut raw))
            .map_err(|e| storage(&self.path, e))?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding unreadable bucket record");
                Ok(None)
            }
        }
    }

    fn store(&mut self, state: &BucketState) -> Result<(), RateLimitError> {
        let json = serde_json::to_vec(state).map_err(|e| storage(&self.path, e))?;
        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| self.file.write_all(&json))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| storage(&self.path, e))
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[async_trait]
impl BucketStore for FileBucketStore {
    async fn lock(&self, key: &str) -> Result<Box<dyn BucketGuard>, RateLimitError> {
        let path = self.path_for(key);
        let file = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || Self::open_locked(&path))
                .await
                .map_err(|e| RateLimitError::Storage(format!("lock task failed: {e}")))??
        };
        Ok(Box::new(FileGuard { file, path }))
    }
}
