//! Version control over the change log.
//!
//! ```text
//!   log:     e0  e1  e2  e3  e4  e5 ...           (append-only, all branches)
//!              \___/       \__/
//!   commits:    C1 ◄────── C2 ◄──── M ◄── main    (content-addressed DAG)
//!                 ▲               /
//!                 └──── C3 ◄─────┘    ◄── feature
//! ```
//!
//! A branch's history is the first-parent chain of its head, each commit
//! contributing its entries in log order, followed by the branch's
//! uncommitted entries. Commits and the graph never change once written.
//!
//! - [`commit`] — commit ids, commits and branch pointers
//! - [`graph`] — arena DAG with generation numbers and LCA search
//! - [`ops`] — commit, branch, merge and revert on a document session

pub mod commit;
pub mod graph;
pub mod ops;

pub use commit::{Branch, BranchId, Commit, CommitId};
pub use graph::CommitGraph;

use crate::change::ChangeId;
use crate::conflict::Conflict;
use crate::coordinator::ConflictReport;

/// Outcome of a branch merge.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    /// A two-parent commit was written on the target
    Merged {
        commit: Commit,
        conflicts: Vec<ConflictReport>,
    },
    /// The source has nothing the target lacks
    UpToDate,
    /// Manual decisions are needed; nothing was written
    Blocked { conflicts: Vec<Conflict> },
}

impl MergeResult {
    pub fn commit(&self) -> Option<&Commit> {
        match self {
            MergeResult::Merged { commit, .. } => Some(commit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VcsError {
    EmptyCommit,
    UnknownChange(ChangeId),
    /// The change is already part of a commit
    AlreadyCommitted(ChangeId),
    /// Commits must take the oldest uncommitted changes of the branch, in order
    NotContiguous(ChangeId),
    /// Pending manual conflicts involve the listed changes
    Blocked(Vec<Conflict>),
    UnknownBranch(String),
    BranchExists(String),
    UnknownCommit(CommitId),
    SameBranch,
    /// The branch has changes outside any commit
    UncommittedChanges(BranchId),
    NoCommonAncestor,
    NotInHistory(CommitId),
    Cancelled,
    MergeFailed(String),
    BrokenParent { commit: CommitId, parent: CommitId },
}

impl std::fmt::Display for VcsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VcsError::EmptyCommit => write!(f, "Commit has no changes"),
            VcsError::UnknownChange(id) => write!(f, "Change {id} is not in the log"),
            VcsError::AlreadyCommitted(id) => write!(f, "Change {id} is already committed"),
            VcsError::NotContiguous(id) => {
                write!(f, "Change {id} is not next in the branch's uncommitted changes")
            }
            VcsError::Blocked(conflicts) => {
                write!(f, "Blocked by {} pending manual conflict(s)", conflicts.len())
            }
            VcsError::UnknownBranch(b) => write!(f, "Unknown branch: {b}"),
            VcsError::BranchExists(name) => write!(f, "Branch '{name}' already exists"),
            VcsError::UnknownCommit(id) => write!(f, "Unknown commit: {id}"),
            VcsError::SameBranch => write!(f, "Cannot merge a branch into itself"),
            VcsError::UncommittedChanges(b) => write!(f, "Branch {b} has uncommitted changes"),
            VcsError::NoCommonAncestor => write!(f, "Branches share no common ancestor"),
            VcsError::NotInHistory(id) => write!(f, "Commit {id} is not in the branch history"),
            VcsError::Cancelled => write!(f, "Operation cancelled"),
            VcsError::MergeFailed(e) => write!(f, "Merge failed: {e}"),
            VcsError::BrokenParent { commit, parent } => {
                write!(f, "Commit {commit} references missing parent {parent}")
            }
        }
    }
}

impl std::error::Error for VcsError {}
