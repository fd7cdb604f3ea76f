//! Commit, branch, merge and revert on a document session.
//!
//! Merging moves the source branch's entries past the LCA onto the target
//! with the same rebase the coordinator uses for live edits. Entries are
//! matched across branches by their root id, so changes that already
//! reached the target through an earlier merge are not applied twice.
//!
//! ```text
//!   source: [ shared prefix | s1 s2 s3 ]        s2 = copy of t1
//!   target: [ shared prefix | t1 t2 ]
//!
//!   steps:  Incoming(s1) Shared(s2 ~ t1) Incoming(s3)   onto: t1 t2
//!   result: t1 t2 s1' s3' [resolutions]  ── merge commit (target, source)
//! ```
//!
//! Nothing is written until every conflict has a decision and the whole
//! plan applies on a scratch copy of the target.

use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

use super::{Branch, BranchId, Commit, CommitId, MergeResult, VcsError};
use crate::change::{now_millis, Change, ChangeId, Origin};
use crate::conflict::{detect, Conflict, ConflictId, Resolution, StrategyKind, SYSTEM_AUTHOR};
use crate::coordinator::{settle, BlockedMerge, ConflictReport, DocumentSession, Integrated, Outgoing, SyncError, SyncPhase};
use crate::log::Disposition;
use crate::ot::{self, Step};
use crate::protocol::CommitBroadcast;

/// One entry a merge will append to the target.
struct Planned {
    original: Change,
    effect: Option<Change>,
    disposition: Disposition,
}

impl DocumentSession {
    // ─── Commits ──────────────────────────────────────────────────────

    /// Snapshot the oldest uncommitted changes of the active branch.
    pub fn commit(
        &mut self,
        change_ids: &[ChangeId],
        message: impl Into<String>,
        author: impl Into<String>,
    ) -> Result<Commit, SyncError> {
        self.guard()?;
        if change_ids.is_empty() {
            return Err(VcsError::EmptyCommit.into());
        }
        let branch = self.active;
        self.ensure_workspace(branch)?;

        let mut seqs = Vec::with_capacity(change_ids.len());
        for id in change_ids {
            let seq = self.log.seq_of(id).ok_or(VcsError::UnknownChange(*id))?;
            if self.committed.contains(&seq) {
                return Err(VcsError::AlreadyCommitted(*id).into());
            }
            seqs.push(seq);
        }
        let ws = self.ws(branch)?;
        for (i, (seq, id)) in seqs.iter().zip(change_ids).enumerate() {
            if ws.uncommitted.get(i) != Some(seq) {
                return Err(VcsError::NotContiguous(*id).into());
            }
        }

        let blocking: Vec<Conflict> = self
            .pending
            .values()
            .filter(|p| change_ids.iter().any(|id| p.conflict.involves(id)))
            .map(|p| p.conflict.clone())
            .collect();
        if !blocking.is_empty() {
            return Err(VcsError::Blocked(blocking).into());
        }

        let parents = self.head_of(branch)?.into_iter().collect();
        let commit = Commit::new(parents, author, message, change_ids.to_vec());
        self.write_commit(branch, commit)
    }

    /// Persist a commit and move `branch` onto it.
    pub(crate) fn write_commit(
        &mut self,
        branch: BranchId,
        commit: Commit,
    ) -> Result<Commit, SyncError> {
        let mut updated = self
            .branches
            .get(&branch)
            .cloned()
            .ok_or_else(|| VcsError::UnknownBranch(branch.to_string()))?;
        self.store.save_commit(self.doc_id, &commit)?;
        self.graph.insert(commit.clone())?;
        updated.head = Some(commit.id.clone());
        self.store.save_branch(self.doc_id, &updated)?;

        let seqs: HashSet<u64> = commit
            .change_ids
            .iter()
            .filter_map(|id| self.log.seq_of(id))
            .collect();
        self.committed.extend(seqs.iter().copied());
        if let Some(ws) = self.workspaces.get_mut(&branch) {
            ws.uncommitted.retain(|seq| !seqs.contains(seq));
        }

        log::info!(
            "Commit {} on '{}' of {}: {} changes",
            commit.id.short(),
            updated.name,
            self.doc_id,
            commit.change_ids.len()
        );
        self.branches.insert(branch, updated);
        self.outbox.push(Outgoing::Commit(CommitBroadcast {
            branch,
            commit: commit.clone(),
        }));
        Ok(commit)
    }

    pub fn get_commit(&self, id: &CommitId) -> Option<&Commit> {
        self.graph.get(id)
    }

    /// First-parent history of a branch, newest first.
    pub fn commit_log(&self, branch: BranchId) -> Result<Vec<&Commit>, SyncError> {
        Ok(match self.head_of(branch)? {
            Some(head) => self.graph.first_parent_chain(&head),
            None => Vec::new(),
        })
    }

    fn head_of(&self, branch: BranchId) -> Result<Option<CommitId>, SyncError> {
        Ok(self
            .branches
            .get(&branch)
            .ok_or_else(|| VcsError::UnknownBranch(branch.to_string()))?
            .head
            .clone())
    }

    // ─── Branches ─────────────────────────────────────────────────────

    pub fn create_branch(
        &mut self,
        name: impl Into<String>,
        from: &CommitId,
    ) -> Result<BranchId, SyncError> {
        self.guard()?;
        let name = name.into();
        if self.branch_by_name(&name).is_some() {
            return Err(VcsError::BranchExists(name).into());
        }
        if !self.graph.contains(from) {
            return Err(VcsError::UnknownCommit(from.clone()).into());
        }
        let branch = Branch {
            id: BranchId::new(),
            name,
            head: Some(from.clone()),
            created_from: Some(from.clone()),
        };
        self.store.save_branch(self.doc_id, &branch)?;
        log::info!("Created branch '{}' at {} on {}", branch.name, from.short(), self.doc_id);
        let id = branch.id;
        self.branches.insert(id, branch);
        Ok(id)
    }

    /// Make `branch` the target of subsequent edits. Its content is
    /// materialized on first use.
    pub fn switch_branch(&mut self, branch: BranchId) -> Result<(), SyncError> {
        if !self.branches.contains_key(&branch) {
            return Err(VcsError::UnknownBranch(branch.to_string()).into());
        }
        self.active = branch;
        Ok(())
    }

    // ─── Merge ────────────────────────────────────────────────────────

    /// Merge `source` into `target`, writing a two-parent commit on the
    /// target.
    ///
    /// Conflicts take the decisions supplied through
    /// [`DocumentSession::resolve_conflict`], then `strategy`. Any conflict
    /// still undecided blocks the merge without writing anything.
    pub fn merge(
        &mut self,
        source: BranchId,
        target: BranchId,
        strategy: StrategyKind,
        cancel: &CancellationToken,
    ) -> Result<MergeResult, SyncError> {
        self.guard()?;
        if source == target {
            return Err(VcsError::SameBranch.into());
        }
        let source_branch = self
            .branches
            .get(&source)
            .cloned()
            .ok_or_else(|| VcsError::UnknownBranch(source.to_string()))?;
        let target_branch = self
            .branches
            .get(&target)
            .cloned()
            .ok_or_else(|| VcsError::UnknownBranch(target.to_string()))?;
        self.ensure_workspace(target)?;
        if !self.ws(target)?.uncommitted.is_empty() {
            return Err(VcsError::UncommittedChanges(target).into());
        }

        let Some(hs) = source_branch.head.clone() else {
            return Ok(MergeResult::UpToDate);
        };
        let Some(ht) = target_branch.head.clone() else {
            return Err(VcsError::NoCommonAncestor.into());
        };
        if hs == ht || self.graph.is_ancestor(&hs, &ht) {
            self.forget_blocked_merge(source, target);
            return Ok(MergeResult::UpToDate);
        }
        let lca = self
            .graph
            .lowest_common_ancestor(&hs, &ht)
            .ok_or(VcsError::NoCommonAncestor)?;
        if cancel.is_cancelled() {
            return Err(VcsError::Cancelled.into());
        }
        log::debug!(
            "Merging '{}' ({}) into '{}' ({}) over {}",
            source_branch.name,
            hs.short(),
            target_branch.name,
            ht.short(),
            lca.short()
        );
        self.transition(SyncPhase::Syncing);

        let source_history = self.history_of(Some(&hs))?;
        let target_history = self.ws(target)?.history.clone();
        let prefix = source_history
            .iter()
            .zip(&target_history)
            .take_while(|(a, b)| a == b)
            .count();

        let mut known_roots = HashSet::new();
        for seq in &target_history[..prefix] {
            if let Some(entry) = self.log.get(*seq) {
                known_roots.insert(entry.original.root());
            }
        }
        let mut target_roots = HashMap::new();
        let mut onto = Vec::new();
        for seq in &target_history[prefix..] {
            if let Some(entry) = self.log.get(*seq) {
                target_roots.insert(entry.original.root(), *seq);
                if let Some(effect) = &entry.effect {
                    onto.push((*seq, effect.clone()));
                }
            }
        }

        let mut steps = Vec::new();
        let mut roots = Vec::new();
        for seq in &source_history[prefix..] {
            let Some(entry) = self.log.get(*seq) else {
                continue;
            };
            let root = entry.original.root();
            let Some(effect) = entry.effect.clone() else {
                continue;
            };
            if known_roots.contains(&root) {
                continue;
            }
            match target_roots.get(&root) {
                Some(key) => steps.push(Step::Shared {
                    key: *key,
                    form: effect,
                }),
                None => steps.push(Step::Incoming(effect)),
            }
            roots.push(root);
        }

        let rebased = ot::rebase_until(steps.clone(), &onto, || cancel.is_cancelled())
            .ok_or(VcsError::Cancelled)?;

        // Decide every conflict before touching anything.
        let mut decided: Vec<(Conflict, Resolution, StrategyKind)> = Vec::new();
        let mut undecided = Vec::new();
        for conflict in detect(&steps, &onto, &rebased) {
            let (resolution, used) = match self.merge_decisions.get(&conflict.id) {
                Some(decision) => (decision.clone(), StrategyKind::Manual),
                None => (strategy.strategy().resolve(&conflict), strategy),
            };
            if resolution.is_manual() {
                undecided.push(conflict);
            } else {
                decided.push((conflict, resolution, used));
            }
        }
        // The clash set was just recomputed; earlier blocks of this merge are stale.
        self.forget_blocked_merge(source, target);
        if !undecided.is_empty() {
            for conflict in &undecided {
                self.merge_pending.insert(
                    conflict.id.clone(),
                    BlockedMerge {
                        conflict: conflict.clone(),
                        source,
                        target,
                    },
                );
            }
            log::warn!(
                "Merge of '{}' into '{}' blocked on {} conflict(s)",
                source_branch.name,
                target_branch.name,
                undecided.len()
            );
            self.settle_phase();
            return Ok(MergeResult::Blocked {
                conflicts: undecided,
            });
        }

        let by_path: HashMap<&str, ConflictId> = decided
            .iter()
            .map(|(c, _, _)| (c.path(), c.id.clone()))
            .collect();
        let version = target_history.len() as u64;
        let mut scratch = self.ws(target)?.doc.clone();
        let mut plan: Vec<Planned> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            let Step::Incoming(change) = step else {
                continue;
            };
            let mut copy = change.clone().with_id(ChangeId::new());
            copy.lineage = Some(roots[index]);
            copy.base_version = version + plan.len() as u64;
            match rebased.applied_step(index) {
                Some(effect) => {
                    let mut effect = effect.clone();
                    effect.id = copy.id;
                    effect.lineage = copy.lineage;
                    effect.base_version = copy.base_version;
                    scratch
                        .apply(&effect)
                        .map_err(|e| VcsError::MergeFailed(e.to_string()))?;
                    plan.push(Planned {
                        original: copy,
                        effect: Some(effect),
                        disposition: Disposition::Applied,
                    });
                }
                None => {
                    let conflict = by_path
                        .get(change.target.path.as_str())
                        .cloned()
                        .ok_or_else(|| {
                            VcsError::MergeFailed(format!("no outcome for '{}'", change.target.path))
                        })?;
                    plan.push(Planned {
                        original: copy,
                        effect: None,
                        disposition: Disposition::Absorbed { conflict },
                    });
                }
            }
        }

        let mut reports = Vec::with_capacity(decided.len());
        if !decided.is_empty() {
            let source_doc = self.log.replay(&source_history)?;
            for (conflict, resolution, used) in decided {
                let proposal = source_doc.payload_at(conflict.path());
                let effect = settle(
                    &conflict,
                    &resolution,
                    &proposal,
                    &scratch,
                    version + plan.len() as u64,
                    used,
                )?;
                scratch
                    .apply(&effect)
                    .map_err(|e| VcsError::MergeFailed(e.to_string()))?;
                plan.push(Planned {
                    original: effect.clone(),
                    effect: Some(effect.clone()),
                    disposition: Disposition::Resolved {
                        conflict: conflict.id.clone(),
                    },
                });
                reports.push(ConflictReport {
                    conflict,
                    resolution,
                    effect: Some(effect),
                });
            }
        }

        if cancel.is_cancelled() {
            self.settle_phase();
            return Err(VcsError::Cancelled.into());
        }

        let mut change_ids = Vec::with_capacity(plan.len());
        for planned in plan {
            change_ids.push(planned.original.id);
            if let Err(e) =
                self.append_entry(target, planned.original, planned.effect, planned.disposition)
            {
                let reason = format!("merge into '{}' interrupted: {e}", target_branch.name);
                self.poison(reason.clone());
                return Err(SyncError::Poisoned(reason));
            }
        }

        let commit = Commit::new(
            vec![ht, hs],
            SYSTEM_AUTHOR,
            format!(
                "Merge branch '{}' into '{}'",
                source_branch.name, target_branch.name
            ),
            change_ids,
        );
        let commit = match self.write_commit(target, commit) {
            Ok(commit) => commit,
            Err(e) => {
                let reason = format!("merge commit on '{}' not recorded: {e}", target_branch.name);
                self.poison(reason.clone());
                return Err(SyncError::Poisoned(reason));
            }
        };
        for report in &reports {
            self.merge_decisions.remove(&report.conflict.id);
        }
        self.settle_phase();
        Ok(MergeResult::Merged {
            commit,
            conflicts: reports,
        })
    }

    fn forget_blocked_merge(&mut self, source: BranchId, target: BranchId) {
        self.merge_pending
            .retain(|_, b| !(b.source == source && b.target == target));
    }

    // ─── Revert ───────────────────────────────────────────────────────

    /// Undo a commit on the active branch with a new commit.
    ///
    /// The inverses are transformed across everything applied since. If an
    /// undo clashes and waits on a manual decision, the undos stay
    /// uncommitted and the blocking conflicts are returned.
    pub fn revert(
        &mut self,
        commit_id: &CommitId,
        author: impl Into<String>,
    ) -> Result<Commit, SyncError> {
        self.guard()?;
        let author = author.into();
        let branch = self.active;
        self.ensure_workspace(branch)?;
        if !self.ws(branch)?.uncommitted.is_empty() {
            return Err(VcsError::UncommittedChanges(branch).into());
        }
        let commit = self
            .graph
            .get(commit_id)
            .cloned()
            .ok_or_else(|| VcsError::UnknownCommit(commit_id.clone()))?;

        let history = self.ws(branch)?.history.clone();
        let mut undos = Vec::new();
        for id in &commit.change_ids {
            let pos = self
                .log
                .seq_of(id)
                .and_then(|seq| history.iter().position(|h| *h == seq))
                .ok_or_else(|| VcsError::NotInHistory(commit_id.clone()))?;
            let Some(inverse) = self.log.get(history[pos]).and_then(|e| e.inverse.clone()) else {
                continue;
            };
            let undo = Change {
                id: ChangeId::new(),
                author: author.clone(),
                base_version: pos as u64 + 1,
                timestamp: now_millis(),
                origin: Origin::Local,
                depends_on: Vec::new(),
                lineage: None,
                resolves: None,
                ..inverse
            };
            undos.push((pos, undo));
        }
        if undos.is_empty() {
            return Err(VcsError::EmptyCommit.into());
        }
        undos.sort_by(|a, b| b.0.cmp(&a.0));

        self.transition(SyncPhase::Syncing);
        let mut ids = Vec::with_capacity(undos.len());
        let mut held = Vec::new();
        for (_, undo) in undos {
            ids.push(undo.id);
            match self.integrate(branch, undo, false) {
                Ok(Integrated::Held(conflict)) => held.push(conflict),
                Ok(_) => {}
                Err(e) => {
                    self.settle_phase();
                    return Err(e);
                }
            }
        }
        if !held.is_empty() {
            self.settle_phase();
            return Err(VcsError::Blocked(held).into());
        }

        let result = self.commit(&ids, format!("Revert \"{}\"", commit.message), author);
        self.settle_phase();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::SyncConfig;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn session() -> DocumentSession {
        DocumentSession::open(
            Uuid::new_v4(),
            Arc::new(MemoryStore::new()),
            SyncConfig::for_testing(),
        )
        .unwrap()
    }

    fn edit(s: &mut DocumentSession, change: Change) -> ChangeId {
        let id = change.id;
        s.apply_local_change(change).unwrap();
        id
    }

    #[test]
    fn test_commit_takes_uncommitted_prefix() {
        let mut s = session();
        let a = edit(&mut s, Change::insert("alice", 0, "body", 0, "a"));
        let b = edit(&mut s, Change::insert("alice", 1, "body", 1, "b"));

        assert_eq!(
            s.commit(&[b], "skip", "alice"),
            Err(SyncError::Vcs(VcsError::NotContiguous(b)))
        );
        let c1 = s.commit(&[a], "first", "alice").unwrap();
        assert!(c1.parent_ids.is_empty());
        assert_eq!(
            s.commit(&[a], "again", "alice"),
            Err(SyncError::Vcs(VcsError::AlreadyCommitted(a)))
        );
        let c2 = s.commit(&[b], "second", "alice").unwrap();
        assert_eq!(c2.parent_ids, vec![c1.id.clone()]);
        assert_eq!(s.branch(BranchId::main()).unwrap().head, Some(c2.id.clone()));
        assert_eq!(s.commit_log(BranchId::main()).unwrap().len(), 2);
        assert!(matches!(
            s.commit(&[], "empty", "alice"),
            Err(SyncError::Vcs(VcsError::EmptyCommit))
        ));
    }

    #[test]
    fn test_branch_names_unique() {
        let mut s = session();
        let a = edit(&mut s, Change::insert("alice", 0, "body", 0, "a"));
        let c = s.commit(&[a], "init", "alice").unwrap();
        s.create_branch("feature", &c.id).unwrap();
        assert_eq!(
            s.create_branch("feature", &c.id),
            Err(SyncError::Vcs(VcsError::BranchExists("feature".into())))
        );
        let missing = CommitId("00".into());
        assert_eq!(
            s.create_branch("other", &missing),
            Err(SyncError::Vcs(VcsError::UnknownCommit(missing.clone())))
        );
    }

    #[test]
    fn test_merge_disjoint_edits() {
        let mut s = session();
        let a = edit(&mut s, Change::insert("alice", 0, "body", 0, "Hello"));
        let base = s.commit(&[a], "init", "alice").unwrap();
        let feature = s.create_branch("feature", &base.id).unwrap();

        let m1 = edit(&mut s, Change::insert("alice", 1, "body", 5, " world"));
        s.commit(&[m1], "main edit", "alice").unwrap();

        s.switch_branch(feature).unwrap();
        let f1 = edit(&mut s, Change::insert("bob", 1, "body", 0, ">> "));
        s.commit(&[f1], "feature edit", "bob").unwrap();
        assert_eq!(s.document().unwrap().text("body"), Some(">> Hello"));

        let result = s
            .merge(feature, BranchId::main(), StrategyKind::Manual, &CancellationToken::new())
            .unwrap();
        let MergeResult::Merged { commit, conflicts } = result else {
            panic!("expected a merge commit");
        };
        assert!(conflicts.is_empty());
        assert!(commit.is_merge());
        assert_eq!(
            s.document_at(BranchId::main()).unwrap().text("body"),
            Some(">> Hello world")
        );

        // merging again changes nothing
        let again = s
            .merge(feature, BranchId::main(), StrategyKind::Manual, &CancellationToken::new())
            .unwrap();
        assert_eq!(again, MergeResult::UpToDate);
    }

    #[test]
    fn test_merge_blocks_then_uses_decision() {
        let mut s = session();
        let a = edit(&mut s, Change::modify("alice", 0, "title", json!("v0")));
        let base = s.commit(&[a], "init", "alice").unwrap();
        let feature = s.create_branch("feature", &base.id).unwrap();

        let m = edit(&mut s, Change::modify("alice", 1, "title", json!("main")));
        s.commit(&[m], "main title", "alice").unwrap();
        s.switch_branch(feature).unwrap();
        let f = edit(&mut s, Change::modify("bob", 1, "title", json!("feature")));
        s.commit(&[f], "feature title", "bob").unwrap();

        let main_log = s.log().len();
        let blocked = s
            .merge(feature, BranchId::main(), StrategyKind::Manual, &CancellationToken::new())
            .unwrap();
        let MergeResult::Blocked { conflicts } = blocked else {
            panic!("expected the merge to block");
        };
        assert_eq!(conflicts.len(), 1);
        assert_eq!(s.log().len(), main_log);
        assert_eq!(s.phase(), SyncPhase::Conflicted);

        s.resolve_conflict(&conflicts[0].id, Resolution::Chose(crate::conflict::Side::A))
            .unwrap();
        let merged = s
            .merge(feature, BranchId::main(), StrategyKind::Manual, &CancellationToken::new())
            .unwrap();
        let MergeResult::Merged { conflicts, .. } = merged else {
            panic!("expected a merge commit");
        };
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            s.document_at(BranchId::main()).unwrap().value("title"),
            Some(&json!("feature"))
        );
    }

    #[test]
    fn test_blocked_merge_cleared_by_strategy_retry() {
        let mut s = session();
        let a = edit(&mut s, Change::modify("alice", 0, "title", json!("v0")));
        let base = s.commit(&[a], "init", "alice").unwrap();
        let feature = s.create_branch("feature", &base.id).unwrap();

        let m = edit(&mut s, Change::modify("alice", 1, "title", json!("main")));
        s.commit(&[m], "main title", "alice").unwrap();
        s.switch_branch(feature).unwrap();
        let f = edit(&mut s, Change::modify("bob", 1, "title", json!("feature")));
        s.commit(&[f], "feature title", "bob").unwrap();

        let blocked = s
            .merge(feature, BranchId::main(), StrategyKind::Manual, &CancellationToken::new())
            .unwrap();
        assert!(matches!(blocked, MergeResult::Blocked { .. }));
        assert_eq!(s.pending_conflicts().len(), 1);

        let merged = s
            .merge(
                feature,
                BranchId::main(),
                StrategyKind::LastWriteWins,
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(merged.commit().is_some());
        assert!(s.pending_conflicts().is_empty());
        assert_eq!(s.phase(), SyncPhase::Synced);

        // main can still commit afterwards
        s.switch_branch(BranchId::main()).unwrap();
        let next = edit(&mut s, Change::modify("alice", 3, "other", json!(1)));
        assert!(s.commit(&[next], "after merge", "alice").is_ok());
    }

    #[test]
    fn test_merge_cancelled_writes_nothing() {
        let mut s = session();
        let a = edit(&mut s, Change::insert("alice", 0, "body", 0, "x"));
        let base = s.commit(&[a], "init", "alice").unwrap();
        let feature = s.create_branch("feature", &base.id).unwrap();
        s.switch_branch(feature).unwrap();
        let f = edit(&mut s, Change::insert("bob", 1, "body", 1, "y"));
        s.commit(&[f], "f", "bob").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let before = s.log().len();
        assert_eq!(
            s.merge(feature, BranchId::main(), StrategyKind::LastWriteWins, &cancel),
            Err(SyncError::Vcs(VcsError::Cancelled))
        );
        assert_eq!(s.log().len(), before);
    }

    #[test]
    fn test_revert_restores_content() {
        let mut s = session();
        let a = edit(&mut s, Change::insert("alice", 0, "body", 0, "Hello"));
        let c1 = s.commit(&[a], "init", "alice").unwrap();
        let b = edit(&mut s, Change::insert("alice", 1, "body", 5, " there"));
        let c2 = s.commit(&[b], "greet", "alice").unwrap();
        let c = edit(&mut s, Change::insert("alice", 2, "body", 0, "Oh, "));
        s.commit(&[c], "prefix", "alice").unwrap();

        let revert = s.revert(&c2.id, "alice").unwrap();
        assert_eq!(revert.message, "Revert \"greet\"");
        assert_eq!(s.document().unwrap().text("body"), Some("Oh, Hello"));
        assert!(s.get_commit(&c1.id).is_some());
    }
}
