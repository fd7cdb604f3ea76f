//! Append-only change log.
//!
//! ```text
//!  seq:   0        1        2            3
//!       ┌────────┬────────┬────────────┬──────────┐
//!       │Applied │Applied │Resolved(c1)│ Held(c2) │ ──► append only
//!       └────────┴────────┴────────────┴──────────┘
//!  effect:  e0       e1      synthetic      -
//! ```
//!
//! Each entry keeps the change as submitted (`original`), the change that
//! actually took effect on the branch (`effect`, already transformed or the
//! synthetic resolution of a conflict) and the inverse computed when the
//! effect was applied. Entries are checksummed so a damaged log is detected
//! on load instead of being silently repaired.
//!
//! Reference: Kleppmann — DDIA, Chapter 11 (Event Sourcing, Immutable Logs)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::change::{Change, ChangeId, Payload};
use crate::conflict::{Conflict, ConflictId};
use crate::document::Document;
use crate::vcs::BranchId;

/// What became of a change when it was integrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Disposition {
    /// Transformed (or not) and applied as-is
    Applied,
    /// Took part in a conflict; `effect` is the synthetic resolution change
    Resolved { conflict: ConflictId },
    /// Waiting on a manual decision; no effect yet
    Held {
        conflict: Conflict,
        /// Node content the submitting author intended
        proposal: Payload,
    },
    /// Merge copy whose effect was folded into a conflict resolution
    Absorbed { conflict: ConflictId },
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::Resolved { .. } => "resolved",
            Disposition::Held { .. } => "held",
            Disposition::Absorbed { .. } => "absorbed",
        }
    }
}

/// A single log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the document log, dense from 0
    pub seq: u64,
    /// Branch the entry was recorded against
    pub branch: BranchId,
    pub original: Change,
    pub effect: Option<Change>,
    pub inverse: Option<Change>,
    pub disposition: Disposition,
    pub checksum: u32,
}

impl LogEntry {
    pub fn new(
        seq: u64,
        branch: BranchId,
        original: Change,
        effect: Option<Change>,
        inverse: Option<Change>,
        disposition: Disposition,
    ) -> Result<Self, LogError> {
        let mut entry = Self {
            seq,
            branch,
            original,
            effect,
            inverse,
            disposition,
            checksum: 0,
        };
        entry.checksum = entry.compute_checksum()?;
        Ok(entry)
    }

    pub fn id(&self) -> ChangeId {
        self.original.id
    }

    /// Verify the entry's checksum.
    pub fn verify(&self) -> bool {
        matches!(self.compute_checksum(), Ok(sum) if sum == self.checksum)
    }

    /// FNV-1a over the encoded fields.
    fn compute_checksum(&self) -> Result<u32, LogError> {
        let body = (
            self.seq,
            &self.branch,
            &self.original,
            &self.effect,
            &self.inverse,
            &self.disposition,
        );
        let bytes = bincode::serde::encode_to_vec(body, bincode::config::standard())
            .map_err(|e| LogError::Encoding(e.to_string()))?;
        let mut hash: u32 = 0x811c_9dc5;
        for byte in bytes {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        Ok(hash)
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| LogError::Encoding(e.to_string()))?;
        Ok(entry)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogError {
    /// Checksum mismatch at `seq`
    Corrupted(u64),
    OutOfOrder { expected: u64, found: u64 },
    DuplicateChange(ChangeId),
    UnknownEntry(u64),
    /// An effect no longer applies during replay
    Replay { seq: u64, reason: String },
    Encoding(String),
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Corrupted(seq) => write!(f, "Log entry {seq} failed checksum verification"),
            LogError::OutOfOrder { expected, found } => {
                write!(f, "Log entry out of order: expected seq {expected}, found {found}")
            }
            LogError::DuplicateChange(id) => write!(f, "Change {id} is already logged"),
            LogError::UnknownEntry(seq) => write!(f, "No log entry {seq}"),
            LogError::Replay { seq, reason } => write!(f, "Replay failed at entry {seq}: {reason}"),
            LogError::Encoding(e) => write!(f, "Log encoding error: {e}"),
        }
    }
}

impl std::error::Error for LogError {}

/// Per-document ordered record of every change.
#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: Vec<LogEntry>,
    index: HashMap<ChangeId, u64>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, verifying order and checksums.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, LogError> {
        let mut log = Self::new();
        for entry in entries {
            log.append(entry)?;
        }
        Ok(log)
    }

    pub fn next_seq(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a sealed entry. The entry must carry the next sequence number.
    pub fn append(&mut self, entry: LogEntry) -> Result<u64, LogError> {
        let expected = self.next_seq();
        if entry.seq != expected {
            return Err(LogError::OutOfOrder {
                expected,
                found: entry.seq,
            });
        }
        if !entry.verify() {
            return Err(LogError::Corrupted(entry.seq));
        }
        if self.index.contains_key(&entry.id()) {
            return Err(LogError::DuplicateChange(entry.id()));
        }
        self.index.insert(entry.id(), entry.seq);
        self.entries.push(entry);
        Ok(expected)
    }

    pub fn get(&self, seq: u64) -> Option<&LogEntry> {
        self.entries.get(seq as usize)
    }

    pub fn find(&self, id: &ChangeId) -> Option<&LogEntry> {
        self.index.get(id).and_then(|seq| self.get(*seq))
    }

    pub fn seq_of(&self, id: &ChangeId) -> Option<u64> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &ChangeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries with `seq >= from`.
    pub fn since(&self, from: u64) -> &[LogEntry] {
        let start = (from as usize).min(self.entries.len());
        &self.entries[start..]
    }

    pub fn verify(&self) -> Result<(), LogError> {
        match self.entries.iter().find(|e| !e.verify()) {
            Some(bad) => Err(LogError::Corrupted(bad.seq)),
            None => Ok(()),
        }
    }

    /// Re-materialize a document by applying the effects of `seqs` in order.
    pub fn replay(&self, seqs: &[u64]) -> Result<Document, LogError> {
        let mut doc = Document::new();
        for &seq in seqs {
            let entry = self.get(seq).ok_or(LogError::UnknownEntry(seq))?;
            if let Some(effect) = &entry.effect {
                doc.apply(effect).map_err(|e| LogError::Replay {
                    seq,
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(doc)
    }
}
