//! Content-addressed commits and branch pointers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::change::{now_millis, ChangeId};

/// SHA-256 hex digest identifying a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(pub String);

impl CommitId {
    /// Hash of the sorted change ids followed by the parent ids.
    pub fn compute(change_ids: &[ChangeId], parent_ids: &[CommitId]) -> Self {
        let mut sorted = change_ids.to_vec();
        sorted.sort();
        let mut hasher = Sha256::new();
        for id in &sorted {
            hasher.update(id.0.as_bytes());
        }
        hasher.update([0xffu8]);
        for parent in parent_ids {
            hasher.update(parent.0.as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable snapshot of an ordered set of log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    /// Empty for a root commit, two entries for a merge
    pub parent_ids: Vec<CommitId>,
    pub author: String,
    pub message: String,
    /// In log order
    pub change_ids: Vec<ChangeId>,
    pub timestamp: u64,
}

impl Commit {
    pub fn new(
        parent_ids: Vec<CommitId>,
        author: impl Into<String>,
        message: impl Into<String>,
        change_ids: Vec<ChangeId>,
    ) -> Self {
        Self {
            id: CommitId::compute(&change_ids, &parent_ids),
            parent_ids,
            author: author.into(),
            message: message.into(),
            change_ids,
            timestamp: now_millis(),
        }
    }

    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }

    pub fn first_parent(&self) -> Option<&CommitId> {
        self.parent_ids.first()
    }

    /// Whether the id still matches the content.
    pub fn verify(&self) -> bool {
        self.id == CommitId::compute(&self.change_ids, &self.parent_ids)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(pub Uuid);

impl BranchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Every document starts on this branch.
    pub fn main() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::main()
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named, movable pointer into the commit graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub head: Option<CommitId>,
    pub created_from: Option<CommitId>,
}

impl Branch {
    pub fn main() -> Self {
        Self {
            id: BranchId::main(),
            name: "main".to_string(),
            head: None,
            created_from: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_ignores_change_order() {
        let a = ChangeId::new();
        let b = ChangeId::new();
        assert_eq!(CommitId::compute(&[a, b], &[]), CommitId::compute(&[b, a], &[]));
    }

    #[test]
    fn test_commit_id_depends_on_parents() {
        let a = ChangeId::new();
        let root = Commit::new(vec![], "alice", "init", vec![a]);
        let child = Commit::new(vec![root.id.clone()], "alice", "init", vec![a]);
        assert_ne!(root.id, child.id);
        assert!(child.verify());
        assert_eq!(root.id.0.len(), 64);
    }

    #[test]
    fn test_tampered_commit_fails_verification() {
        let mut c = Commit::new(vec![], "alice", "x", vec![ChangeId::new()]);
        c.change_ids.push(ChangeId::new());
        assert!(!c.verify());
    }
}
