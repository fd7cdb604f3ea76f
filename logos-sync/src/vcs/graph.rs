//! Commit DAG as an arena keyed by commit id.
//!
//! Edges are ids, never pointers. Each node caches its generation
//! (`1 + max(parent generations)`) so ancestor walks can stop early and
//! the lowest common ancestor is the deepest shared ancestor.
//!
//! ```text
//!   C1 ── C2 ── C4 ──┐
//!          \          M      generation(M) = 5
//!           C3 ──────┘       lca(C4, C3) = C2
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use super::commit::{Commit, CommitId};
use super::VcsError;

#[derive(Debug, Default)]
pub struct CommitGraph {
    nodes: HashMap<CommitId, (Commit, u64)>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a commit whose parents are already present.
    pub fn insert(&mut self, commit: Commit) -> Result<(), VcsError> {
        if self.nodes.contains_key(&commit.id) {
            return Ok(());
        }
        let mut generation = 0;
        for parent in &commit.parent_ids {
            let (_, g) = self
                .nodes
                .get(parent)
                .ok_or_else(|| VcsError::BrokenParent {
                    commit: commit.id.clone(),
                    parent: parent.clone(),
                })?;
            generation = generation.max(*g);
        }
        self.nodes.insert(commit.id.clone(), (commit, generation + 1));
        Ok(())
    }

    /// Insert commits in any order; fails if some parent never appears.
    pub fn from_commits(commits: Vec<Commit>) -> Result<Self, VcsError> {
        let mut graph = Self::new();
        let mut pending = commits;
        while !pending.is_empty() {
            let before = pending.len();
            let mut blocked = Vec::new();
            for commit in pending {
                if commit.parent_ids.iter().all(|p| graph.contains(p)) {
                    graph.insert(commit)?;
                } else {
                    blocked.push(commit);
                }
            }
            if blocked.len() == before {
                let commit = &blocked[0];
                let parent = commit
                    .parent_ids
                    .iter()
                    .find(|p| !graph.contains(p) && !blocked.iter().any(|c| &c.id == *p))
                    .or_else(|| commit.parent_ids.first())
                    .cloned()
                    .unwrap_or_else(|| commit.id.clone());
                return Err(VcsError::BrokenParent {
                    commit: commit.id.clone(),
                    parent,
                });
            }
            pending = blocked;
        }
        Ok(graph)
    }

    pub fn get(&self, id: &CommitId) -> Option<&Commit> {
        self.nodes.get(id).map(|(c, _)| c)
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn generation(&self, id: &CommitId) -> Option<u64> {
        self.nodes.get(id).map(|(_, g)| *g)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn commits(&self) -> impl Iterator<Item = &Commit> {
        self.nodes.values().map(|(c, _)| c)
    }

    /// Every ancestor of `id`, including itself.
    pub fn ancestors(&self, id: &CommitId) -> HashSet<CommitId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(commit) = self.get(&next) {
                queue.extend(commit.parent_ids.iter().cloned());
            }
        }
        seen
    }

    /// Whether `ancestor` is reachable from `descendant` (or equal to it).
    pub fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> bool {
        let Some(floor) = self.generation(ancestor) else {
            return false;
        };
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([descendant.clone()]);
        while let Some(next) = queue.pop_front() {
            if &next == ancestor {
                return true;
            }
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some((commit, g)) = self.nodes.get(&next) {
                if *g > floor {
                    queue.extend(commit.parent_ids.iter().cloned());
                }
            }
        }
        false
    }

    /// Deepest commit reachable from both `a` and `b`.
    pub fn lowest_common_ancestor(&self, a: &CommitId, b: &CommitId) -> Option<CommitId> {
        let from_a = self.ancestors(a);
        let from_b = self.ancestors(b);
        from_a
            .intersection(&from_b)
            .filter_map(|id| self.generation(id).map(|g| (g, id)))
            .max_by(|(ga, ia), (gb, ib)| ga.cmp(gb).then_with(|| ib.cmp(ia)))
            .map(|(_, id)| id.clone())
    }

    /// `head`, its first parent, and so on back to the root (newest first).
    pub fn first_parent_chain(&self, head: &CommitId) -> Vec<&Commit> {
        let mut chain = Vec::new();
        let mut cursor = self.get(head);
        while let Some(commit) = cursor {
            chain.push(commit);
            cursor = commit.first_parent().and_then(|p| self.get(p));
        }
        chain
    }
}
