//! Presence tracking: who is in a document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! set_presence ──► DashMap<(doc, user), Presence> ◄── get_active_users
//!                          ▲                           (filter at read time)
//!                          │ retain(expired)
//!                   sweeper task (tokio interval)
//! ```
//!
//! Expiry is implicit: a record older than the timeout is simply not
//! returned. The sweep only reclaims memory, so it is idempotent and never
//! blocks readers of other shards. Presence is never written to the change
//! log and plays no part in conflict resolution.
//!
//! Reference: Kleppmann, Chapter 8 — Unreliable Clocks

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::change::now_millis;

/// Caret and optional selection inside a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub path: String,
    pub offset: usize,
    /// Selected range `(start, end)` in chars
    pub selection: Option<(usize, usize)>,
}

impl Cursor {
    pub fn at(path: impl Into<String>, offset: usize) -> Self {
        Self {
            path: path.into(),
            offset,
            selection: None,
        }
    }

    pub fn selecting(path: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            path: path.into(),
            offset: end,
            selection: Some((start.min(end), start.max(end))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub cursor: Cursor,
    pub status: PresenceStatus,
    /// Milliseconds since the Unix epoch
    pub last_seen: u64,
}

impl Presence {
    pub fn is_expired(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.last_seen) >= timeout.as_millis() as u64
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// `(document, user)` pairs that expired
    pub expired: Vec<(Uuid, String)>,
    pub remaining: usize,
}

/// Concurrent presence map shared by every document.
pub struct PresenceTracker {
    entries: DashMap<(Uuid, String), Presence>,
    timeout: Duration,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Upsert a user's presence, refreshing `last_seen`.
    pub fn set_presence(
        &self,
        doc_id: Uuid,
        user_id: &str,
        cursor: Cursor,
        status: PresenceStatus,
    ) -> Presence {
        self.set_presence_at(doc_id, user_id, cursor, status, now_millis())
    }

    /// [`set_presence`](Self::set_presence) with an explicit clock.
    pub fn set_presence_at(
        &self,
        doc_id: Uuid,
        user_id: &str,
        cursor: Cursor,
        status: PresenceStatus,
        now: u64,
    ) -> Presence {
        let presence = Presence {
            user_id: user_id.to_string(),
            cursor,
            status,
            last_seen: now,
        };
        self.entries
            .insert((doc_id, user_id.to_string()), presence.clone());
        presence
    }

    /// Users seen within `timeout`, ordered by user id.
    pub fn get_active_users(&self, doc_id: Uuid, timeout: Duration) -> Vec<Presence> {
        self.get_active_users_at(doc_id, timeout, now_millis())
    }

    pub fn get_active_users_at(&self, doc_id: Uuid, timeout: Duration, now: u64) -> Vec<Presence> {
        let mut active: Vec<Presence> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == doc_id && !e.value().is_expired(now, timeout))
            .map(|e| e.value().clone())
            .collect();
        active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        active
    }

    /// Explicit leave.
    pub fn leave(&self, doc_id: Uuid, user_id: &str) -> Option<Presence> {
        self.entries
            .remove(&(doc_id, user_id.to_string()))
            .map(|(_, p)| p)
    }

    /// Drop records older than the tracker's timeout.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(now_millis())
    }

    pub fn sweep_at(&self, now: u64) -> SweepReport {
        let mut expired = Vec::new();
        self.entries.retain(|key, presence| {
            if presence.is_expired(now, self.timeout) {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });
        let report = SweepReport {
            expired,
            remaining: self.entries.len(),
        };
        log::trace!(
            "Presence sweep: {} expired, {} remaining",
            report.expired.len(),
            report.remaining
        );
        report
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            log::debug!("Presence sweeper stopped");
        })
    }
}
