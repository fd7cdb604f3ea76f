//! Durable FIFO of changes authored while disconnected.
//!
//! Every mutation is written through to an [`OfflineJournal`] before it
//! returns, so a queue survives restarts. On reconnect the engine replays a
//! snapshot through `sync_batch` and removes each change only once its batch
//! has returned; changes held on dependencies stay queued.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::change::{now_millis, Change, ChangeId};
use crate::storage::{OfflineJournal, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedChange {
    pub document_id: Uuid,
    pub change: Change,
    pub queued_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfflineError {
    /// Queue is at capacity
    Full(usize),
    /// Only the queue owner's changes may be queued
    ForeignAuthor { owner: String, author: String },
    Storage(StoreError),
}

impl std::fmt::Display for OfflineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfflineError::Full(max) => write!(f, "Offline queue full ({max} changes)"),
            OfflineError::ForeignAuthor { owner, author } => {
                write!(f, "Queue of '{owner}' cannot hold a change by '{author}'")
            }
            OfflineError::Storage(e) => write!(f, "Offline journal: {e}"),
        }
    }
}

impl std::error::Error for OfflineError {}

impl From<StoreError> for OfflineError {
    fn from(e: StoreError) -> Self {
        OfflineError::Storage(e)
    }
}

/// Offline queue for one user.
pub struct OfflineQueue {
    user_id: String,
    queue: VecDeque<QueuedChange>,
    max_size: usize,
    journal: Option<Arc<dyn OfflineJournal>>,
}

impl OfflineQueue {
    /// In-memory queue.
    pub fn new(user_id: impl Into<String>, max_size: usize) -> Self {
        Self {
            user_id: user_id.into(),
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            journal: None,
        }
    }

    /// Queue backed by `journal`, restoring whatever it already holds.
    pub fn durable(
        user_id: impl Into<String>,
        max_size: usize,
        journal: Arc<dyn OfflineJournal>,
    ) -> Result<Self, OfflineError> {
        let user_id = user_id.into();
        let restored = journal.load_queue(&user_id)?;
        if !restored.is_empty() {
            log::info!("Restored {} offline changes for '{user_id}'", restored.len());
        }
        Ok(Self {
            user_id,
            queue: restored.into(),
            max_size,
            journal: Some(journal),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue a change for later replay.
    pub fn enqueue(&mut self, document_id: Uuid, change: Change) -> Result<(), OfflineError> {
        if self.queue.len() >= self.max_size {
            return Err(OfflineError::Full(self.max_size));
        }
        if change.author != self.user_id {
            return Err(OfflineError::ForeignAuthor {
                owner: self.user_id.clone(),
                author: change.author,
            });
        }
        self.queue.push_back(QueuedChange {
            document_id,
            change,
            queued_at: now_millis(),
        });
        if let Err(e) = self.persist() {
            self.queue.pop_back();
            return Err(e);
        }
        Ok(())
    }

    /// Take every queued change in authoring order.
    pub fn drain(&mut self) -> Result<Vec<QueuedChange>, OfflineError> {
        let drained: Vec<QueuedChange> = self.queue.drain(..).collect();
        if let Err(e) = self.persist() {
            self.queue.extend(drained);
            return Err(e);
        }
        Ok(drained)
    }

    /// Put changes back at the head of the queue, keeping their order.
    /// Capacity is not enforced here: these changes were already admitted.
    pub fn requeue_front(&mut self, changes: Vec<QueuedChange>) -> Result<(), OfflineError> {
        let count = changes.len();
        for queued in changes.into_iter().rev() {
            self.queue.push_front(queued);
        }
        if let Err(e) = self.persist() {
            self.queue.drain(..count);
            return Err(e);
        }
        Ok(())
    }

    /// Copy of the queue in authoring order; the journal is untouched.
    pub fn snapshot(&self) -> Vec<QueuedChange> {
        self.queue.iter().cloned().collect()
    }

    /// Drop the given changes once they are integrated or rejected.
    pub fn remove(&mut self, ids: &HashSet<ChangeId>) -> Result<usize, OfflineError> {
        let before = self.queue.clone();
        self.queue.retain(|q| !ids.contains(&q.change.id));
        let removed = before.len() - self.queue.len();
        if removed == 0 {
            return Ok(0);
        }
        if let Err(e) = self.persist() {
            self.queue = before;
            return Err(e);
        }
        Ok(removed)
    }

    pub fn peek(&self) -> Option<&QueuedChange> {
        self.queue.front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn persist(&self) -> Result<(), OfflineError> {
        if let Some(journal) = &self.journal {
            let snapshot: Vec<QueuedChange> = self.queue.iter().cloned().collect();
            journal.save_queue(&self.user_id, &snapshot)?;
        }
        Ok(())
    }
}
