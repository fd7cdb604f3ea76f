//! Storage collaborator for change logs, commit DAGs and offline queues.
//!
//! ```text
//! ┌─────────────────┐  append_change / load_changes_since  ┌──────────────┐
//! │ DocumentSession │ ───────────────────────────────────► │ ChangeStore  │
//! │ (per document)  │  save_commit / load_commit           │              │
//! └─────────────────┘  save_branch / list_branches         ├──────────────┤
//!                                                          │ MemoryStore  │
//! ┌─────────────────┐  save_queue / load_queue             │ RocksStore   │
//! │ OfflineQueue    │ ───────────────────────────────────► │              │
//! └─────────────────┘                                      └──────────────┘
//! ```
//!
//! The engine only relies on the traits; `MemoryStore` backs tests and
//! embedded use, `RocksStore` gives durable column-family storage.

pub mod rocks;

pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use crate::log::LogEntry;
use crate::offline::QueuedChange;
use crate::vcs::{Branch, Commit, CommitId};

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// Document not found
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Appends must extend the log by exactly one entry
    OutOfOrder { expected: u64, found: u64 },
    /// The backend refused the write
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::OutOfOrder { expected, found } => {
                write!(f, "Append out of order: expected seq {expected}, got {found}")
            }
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Operations the engine needs from a persistence backend.
pub trait ChangeStore: Send + Sync {
    /// Persist one log entry; `entry.seq` must be the next position.
    fn append_change(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), StoreError>;
    /// Entries with `seq >= since`, in order.
    fn load_changes_since(&self, doc_id: Uuid, since: u64) -> Result<Vec<LogEntry>, StoreError>;
    fn save_commit(&self, doc_id: Uuid, commit: &Commit) -> Result<(), StoreError>;
    fn load_commit(&self, doc_id: Uuid, id: &CommitId) -> Result<Option<Commit>, StoreError>;
    fn list_commits(&self, doc_id: Uuid) -> Result<Vec<Commit>, StoreError>;
    fn save_branch(&self, doc_id: Uuid, branch: &Branch) -> Result<(), StoreError>;
    fn list_branches(&self, doc_id: Uuid) -> Result<Vec<Branch>, StoreError>;
}

/// Durable backing for per-user offline queues.
pub trait OfflineJournal: Send + Sync {
    fn save_queue(&self, user_id: &str, queue: &[QueuedChange]) -> Result<(), StoreError>;
    fn load_queue(&self, user_id: &str) -> Result<Vec<QueuedChange>, StoreError>;
}

#[derive(Debug, Default)]
struct DocumentRecords {
    entries: Vec<LogEntry>,
    commits: Vec<Commit>,
    branches: Vec<Branch>,
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Uuid, DocumentRecords>>,
    queues: RwLock<HashMap<String, Vec<QueuedChange>>>,
    fail_armed: AtomicBool,
    appends_left: AtomicU64,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append after the next `n` fail. Used to exercise
    /// failure handling.
    pub fn fail_appends_after(&self, n: u64) {
        self.appends_left.store(n, Ordering::SeqCst);
        self.fail_armed.store(true, Ordering::SeqCst);
    }

    /// Overwrite a stored entry in place, bypassing append-only checks.
    /// Only for tests that simulate on-disk damage.
    #[doc(hidden)]
    pub fn tamper(&self, doc_id: Uuid, seq: u64, f: impl FnOnce(&mut LogEntry)) {
        if let Ok(mut docs) = self.documents.write() {
            if let Some(entry) = docs
                .get_mut(&doc_id)
                .and_then(|d| d.entries.get_mut(seq as usize))
            {
                f(entry);
            }
        }
    }

    fn take_append_permit(&self) -> Result<(), StoreError> {
        if !self.fail_armed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let left = self.appends_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StoreError::Unavailable("injected append failure".into()));
        }
        self.appends_left.store(left - 1, Ordering::SeqCst);
        Ok(())
    }
}

impl ChangeStore for MemoryStore {
    fn append_change(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), StoreError> {
        self.take_append_permit()?;
        let mut docs = self.documents.write().map_err(poisoned)?;
        let records = docs.entry(doc_id).or_default();
        let expected = records.entries.len() as u64;
        if entry.seq != expected {
            return Err(StoreError::OutOfOrder {
                expected,
                found: entry.seq,
            });
        }
        records.entries.push(entry.clone());
        Ok(())
    }

    fn load_changes_since(&self, doc_id: Uuid, since: u64) -> Result<Vec<LogEntry>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs
            .get(&doc_id)
            .map(|d| d.entries.iter().skip(since as usize).cloned().collect())
            .unwrap_or_default())
    }

    fn save_commit(&self, doc_id: Uuid, commit: &Commit) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let records = docs.entry(doc_id).or_default();
        if !records.commits.iter().any(|c| c.id == commit.id) {
            records.commits.push(commit.clone());
        }
        Ok(())
    }

    fn load_commit(&self, doc_id: Uuid, id: &CommitId) -> Result<Option<Commit>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs
            .get(&doc_id)
            .and_then(|d| d.commits.iter().find(|c| &c.id == id).cloned()))
    }

    fn list_commits(&self, doc_id: Uuid) -> Result<Vec<Commit>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs.get(&doc_id).map(|d| d.commits.clone()).unwrap_or_default())
    }

    fn save_branch(&self, doc_id: Uuid, branch: &Branch) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let records = docs.entry(doc_id).or_default();
        match records.branches.iter_mut().find(|b| b.id == branch.id) {
            Some(existing) => *existing = branch.clone(),
            None => records.branches.push(branch.clone()),
        }
        Ok(())
    }

    fn list_branches(&self, doc_id: Uuid) -> Result<Vec<Branch>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs.get(&doc_id).map(|d| d.branches.clone()).unwrap_or_default())
    }
}

impl OfflineJournal for MemoryStore {
    fn save_queue(&self, user_id: &str, queue: &[QueuedChange]) -> Result<(), StoreError> {
        let mut queues = self.queues.write().map_err(poisoned)?;
        queues.insert(user_id.to_string(), queue.to_vec());
        Ok(())
    }

    fn load_queue(&self, user_id: &str) -> Result<Vec<QueuedChange>, StoreError> {
        let queues = self.queues.read().map_err(poisoned)?;
        Ok(queues.get(user_id).cloned().unwrap_or_default())
    }
}
