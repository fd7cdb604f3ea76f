//! # logos-sync — Collaborative synchronization engine for Logos
//!
//! Keeps a shared document consistent while several participants edit it
//! concurrently, and keeps a commit history with branches on top of the
//! change log.
//!
//! ## Architecture
//!
//! ```text
//!  local edit        remote edit        offline replay
//!      │                  │                   │
//!      ▼                  ▼                   ▼
//! ┌──────────────────────────────────────────────────┐
//! │ SyncEngine (per-document mutex, bounded wait)    │
//! └──────────────────────┬───────────────────────────┘
//!                        ▼
//! ┌──────────────────────────────────────────────────┐
//! │ DocumentSession                                  │
//! │   validate ─► OT rebase ─► conflict strategy     │
//! │        │                        │                │
//! │        ▼                        ▼                │
//! │   ChangeLog (append-only)   CommitGraph (DAG)    │
//! └──────────┬────────────────────────┬──────────────┘
//!            ▼                        ▼
//!      ChangeStore (MemoryStore | RocksStore + LZ4)
//!            │
//!            └──► outbox ─► RoomManager ─► Envelope fan-out
//! ```
//!
//! ## Modules
//!
//! - [`change`] — changes, targets and payloads
//! - [`document`] — flat path → node content model
//! - [`ot`] — pairwise transform and history rebase
//! - [`conflict`] — conflict detection and resolution strategies
//! - [`log`] — append-only, checksummed change log
//! - [`coordinator`] — per-document integration state machine
//! - [`vcs`] — commits, branches, three-way merge, revert
//! - [`presence`] — ephemeral cursors with expiry
//! - [`offline`] — durable queue of changes made while disconnected
//! - [`protocol`] — broadcast envelopes
//! - [`broadcast`] — room fan-out
//! - [`storage`] — persistence contract, in-memory and RocksDB stores
//! - [`engine`] — multi-document front door
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Transform pair | <1μs |
//! | Remote change over 64-entry window | <500μs |
//! | Offline replay (1K changes) | <50ms |
//! | Log append (RocksDB, sync off) | <20μs |

pub mod broadcast;
pub mod change;
pub mod conflict;
pub mod coordinator;
pub mod document;
pub mod engine;
pub mod log;
pub mod offline;
pub mod ot;
pub mod presence;
pub mod protocol;
pub mod storage;
pub mod vcs;

// Re-exports for convenience
pub use change::{Change, ChangeError, ChangeId, OperationType, Origin, Payload, Target};
pub use conflict::{Conflict, ConflictId, ConflictKind, Resolution, Side, StrategyKind};
pub use coordinator::{
    BatchOutcome, ConflictReport, DocumentSession, Integrated, SyncConfig, SyncError, SyncPhase,
};
pub use document::Document;
pub use engine::{EngineConfig, EngineError, OfflineReplay, SyncEngine};
pub use crate::log::{ChangeLog, Disposition, LogEntry};
pub use offline::{OfflineError, OfflineQueue, QueuedChange};
pub use presence::{Cursor, Presence, PresenceStatus, PresenceTracker};
pub use protocol::{Envelope, MessageKind, ProtocolError};
pub use storage::{ChangeStore, MemoryStore, OfflineJournal, RocksStore, StoreConfig, StoreError};
pub use vcs::{Branch, BranchId, Commit, CommitId, MergeResult, VcsError};
