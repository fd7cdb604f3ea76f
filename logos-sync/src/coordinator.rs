//! Per-document sync coordinator.
//!
//! ```text
//!            submit / sync_batch / merge / revert
//!   ┌──────┐ ───────────────────────────────► ┌─────────┐
//!   │ Idle │                                  │ Syncing │
//!   └──────┘ ◄─────── take_outbox ─┐          └────┬────┘
//!       ▲                          │               │
//!       │                    ┌─────┴──┐      ┌─────┴──────┐
//!       └── resolve_conflict │ Synced │      │ Conflicted │
//!                            └────────┘      └────────────┘
//! ```
//!
//! Incoming change with base `b` on a branch at version `v`:
//!
//! 1. validate, reject duplicates, bases ahead of `v` and bases older than
//!    the staleness window
//! 2. transform across `history[b..v]`; the author's own entries in that
//!    window are bridged instead of transformed against (Jupiter-style)
//! 3. irreconcilable pairs become conflicts, settled by the configured
//!    strategy into a synthetic change, or held for a manual decision
//! 4. append the entry, apply the effect, queue a broadcast
//!
//! All mutation of a session happens under the engine's per-document lock.
//!
//! Reference: Nichols et al. — Jupiter Collaboration System (1995)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::change::{Change, ChangeError, ChangeId, Payload};
use crate::conflict::{
    detect, Conflict, ConflictId, Resolution, ResolutionRecord, Side, StrategyKind, SYSTEM_AUTHOR,
};
use crate::document::Document;
use crate::log::{ChangeLog, Disposition, LogEntry, LogError};
use crate::ot::{self, Rebased, Step};
use crate::protocol::{ChangeBroadcast, CommitBroadcast};
use crate::storage::{ChangeStore, StoreError};
use crate::vcs::{Branch, BranchId, Commit, CommitGraph, CommitId, VcsError};

/// Per-document synchronization settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Maximum distance between a change's base and the branch version
    pub staleness_window: u64,
    /// Strategy for conflicts found while integrating changes
    pub strategy: StrategyKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            staleness_window: 64,
            strategy: StrategyKind::LastWriteWins,
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            staleness_window: 8,
            strategy: StrategyKind::LastWriteWins,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    Conflicted,
    Synced,
}

/// What happened to a submitted change.
#[derive(Debug, Clone, PartialEq)]
pub enum Integrated {
    /// Applied, possibly transformed; carries the effect
    Applied(Change),
    /// Clashed and was settled by a strategy
    Resolved {
        conflict: Conflict,
        resolution: Resolution,
        effect: Change,
    },
    /// Clashed and waits for a manual decision
    Held(Conflict),
}

impl Integrated {
    pub fn effect(&self) -> Option<&Change> {
        match self {
            Integrated::Applied(c) => Some(c),
            Integrated::Resolved { effect, .. } => Some(effect),
            Integrated::Held(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictReport {
    pub conflict: Conflict,
    pub resolution: Resolution,
    /// Synthetic change recorded for the decision, `None` while manual
    pub effect: Option<Change>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub change: Change,
    pub reason: SyncError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeldChange {
    pub change: Change,
    /// Dependencies that were rejected, held or never seen
    pub waiting_on: Vec<ChangeId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub applied: Vec<Change>,
    pub conflicts: Vec<ConflictReport>,
    pub rejected: Vec<Rejected>,
    pub held: Vec<HeldChange>,
}

/// Broadcasts produced by a session, drained by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Change(ChangeBroadcast),
    Commit(CommitBroadcast),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    StaleBaseVersion { base: u64, current: u64, window: u64 },
    /// The change claims a version the branch has not reached
    FutureBase { base: u64, current: u64 },
    Malformed(ChangeError),
    MissingDependency(ChangeId),
    UnknownConflict(ConflictId),
    InvalidResolution(String),
    Vcs(VcsError),
    Storage(StoreError),
    /// Log or DAG damage found while loading or replaying
    Corrupted(String),
    /// Writes are refused after a fatal failure
    Poisoned(String),
}

impl SyncError {
    /// Whether the caller can fix the input and retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Vcs(VcsError::BrokenParent { .. }) => false,
            SyncError::Storage(_) | SyncError::Corrupted(_) | SyncError::Poisoned(_) => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::StaleBaseVersion {
                base,
                current,
                window,
            } => write!(
                f,
                "Stale base version {base}: document is at {current}, window is {window}"
            ),
            SyncError::FutureBase { base, current } => {
                write!(f, "Base version {base} is ahead of document version {current}")
            }
            SyncError::Malformed(e) => write!(f, "Malformed change: {e}"),
            SyncError::MissingDependency(id) => write!(f, "Missing dependency: {id}"),
            SyncError::UnknownConflict(id) => write!(f, "Unknown conflict: {id}"),
            SyncError::InvalidResolution(e) => write!(f, "Invalid resolution: {e}"),
            SyncError::Vcs(e) => write!(f, "{e}"),
            SyncError::Storage(e) => write!(f, "Storage failure: {e}"),
            SyncError::Corrupted(e) => write!(f, "Corrupted document: {e}"),
            SyncError::Poisoned(e) => write!(f, "Document is poisoned: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ChangeError> for SyncError {
    fn from(e: ChangeError) -> Self {
        SyncError::Malformed(e)
    }
}

impl From<VcsError> for SyncError {
    fn from(e: VcsError) -> Self {
        SyncError::Vcs(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e)
    }
}

impl From<LogError> for SyncError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::DuplicateChange(id) => SyncError::Malformed(ChangeError::DuplicateId(id)),
            other => SyncError::Corrupted(other.to_string()),
        }
    }
}

/// Materialized state of one branch.
#[derive(Debug, Clone, Default)]
pub(crate) struct Workspace {
    /// Log seqs in application order; `len()` is the branch version
    pub history: Vec<u64>,
    pub doc: Document,
    /// Suffix of `history` not yet in any commit
    pub uncommitted: Vec<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingConflict {
    pub conflict: Conflict,
    pub branch: BranchId,
    pub proposal: Payload,
}

/// A conflict blocking the merge of `source` into `target`.
#[derive(Debug, Clone)]
pub(crate) struct BlockedMerge {
    pub conflict: Conflict,
    pub source: BranchId,
    pub target: BranchId,
}

/// Client form cache for one integration, keyed by `(history position, version)`.
type FormCache = HashMap<(usize, usize), Option<Change>>;

/// Everything the engine knows about one document.
pub struct DocumentSession {
    pub(crate) doc_id: Uuid,
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<dyn ChangeStore>,
    pub(crate) log: ChangeLog,
    pub(crate) graph: CommitGraph,
    pub(crate) branches: HashMap<BranchId, Branch>,
    pub(crate) workspaces: HashMap<BranchId, Workspace>,
    /// Seqs contained in some commit
    pub(crate) committed: HashSet<u64>,
    pub(crate) active: BranchId,
    pub(crate) pending: BTreeMap<ConflictId, PendingConflict>,
    /// Manual decisions supplied for merge conflicts, reused on retry
    pub(crate) merge_decisions: HashMap<ConflictId, Resolution>,
    pub(crate) merge_pending: BTreeMap<ConflictId, BlockedMerge>,
    pub(crate) unacked: Vec<ChangeId>,
    pub(crate) phase: SyncPhase,
    pub(crate) outbox: Vec<Outgoing>,
    pub(crate) poisoned: Option<String>,
}

impl DocumentSession {
    /// Open a document from the store.
    ///
    /// Read failures are returned; damaged content poisons the session so
    /// it can still be inspected but never written.
    pub fn open(
        doc_id: Uuid,
        store: Arc<dyn ChangeStore>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let entries = store.load_changes_since(doc_id, 0)?;
        let commits = store.list_commits(doc_id)?;
        let branches = store.list_branches(doc_id)?;

        let mut session = Self {
            doc_id,
            config,
            store,
            log: ChangeLog::new(),
            graph: CommitGraph::new(),
            branches: HashMap::new(),
            workspaces: HashMap::new(),
            committed: HashSet::new(),
            active: BranchId::main(),
            pending: BTreeMap::new(),
            merge_decisions: HashMap::new(),
            merge_pending: BTreeMap::new(),
            unacked: Vec::new(),
            phase: SyncPhase::Idle,
            outbox: Vec::new(),
            poisoned: None,
        };

        if let Err(reason) = session.restore(entries, commits, branches) {
            session.poison(reason);
            return Ok(session);
        }
        if !session.branches.contains_key(&BranchId::main()) {
            let main = Branch::main();
            session.store.save_branch(doc_id, &main)?;
            session.branches.insert(main.id, main);
        }
        log::info!(
            "Opened document {doc_id}: {} entries, {} commits, {} branches",
            session.log.len(),
            session.graph.len(),
            session.branches.len()
        );
        Ok(session)
    }

    fn restore(
        &mut self,
        entries: Vec<LogEntry>,
        commits: Vec<Commit>,
        branches: Vec<Branch>,
    ) -> Result<(), String> {
        self.log = ChangeLog::from_entries(entries).map_err(|e| e.to_string())?;

        if let Some(bad) = commits.iter().find(|c| !c.verify()) {
            return Err(format!("commit {} does not match its content", bad.id));
        }
        self.graph = CommitGraph::from_commits(commits).map_err(|e| e.to_string())?;
        for commit in self.graph.commits() {
            for id in &commit.change_ids {
                let seq = self
                    .log
                    .seq_of(id)
                    .ok_or_else(|| format!("commit {} references unknown change {id}", commit.id))?;
                self.committed.insert(seq);
            }
        }

        for branch in branches {
            if let Some(head) = &branch.head {
                if !self.graph.contains(head) {
                    return Err(format!("branch '{}' points at missing commit {head}", branch.name));
                }
            }
            self.branches.insert(branch.id, branch);
        }

        for entry in self.log.entries() {
            match &entry.disposition {
                Disposition::Held { conflict, proposal } => {
                    self.pending.insert(
                        conflict.id.clone(),
                        PendingConflict {
                            conflict: conflict.clone(),
                            branch: entry.branch,
                            proposal: proposal.clone(),
                        },
                    );
                }
                Disposition::Resolved { conflict } => {
                    self.pending.remove(conflict);
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn set_strategy(&mut self, strategy: StrategyKind) {
        self.config.strategy = strategy;
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    pub fn active_branch(&self) -> BranchId {
        self.active
    }

    pub fn branches(&self) -> Vec<&Branch> {
        let mut all: Vec<&Branch> = self.branches.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn branch(&self, id: BranchId) -> Option<&Branch> {
        self.branches.get(&id)
    }

    pub fn branch_by_name(&self, name: &str) -> Option<&Branch> {
        self.branches.values().find(|b| b.name == name)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn pending_conflicts(&self) -> Vec<&Conflict> {
        self.pending
            .values()
            .map(|p| &p.conflict)
            .chain(self.merge_pending.values().map(|b| &b.conflict))
            .collect()
    }

    pub fn unacknowledged(&self) -> &[ChangeId] {
        &self.unacked
    }

    /// Document content of the active branch.
    pub fn document(&mut self) -> Result<&Document, SyncError> {
        let branch = self.active;
        self.document_at(branch)
    }

    pub fn document_at(&mut self, branch: BranchId) -> Result<&Document, SyncError> {
        self.ensure_workspace(branch)?;
        Ok(&self.ws(branch)?.doc)
    }

    /// Version of the active branch.
    pub fn version(&mut self) -> Result<u64, SyncError> {
        let branch = self.active;
        self.version_of(branch)
    }

    pub fn version_of(&mut self, branch: BranchId) -> Result<u64, SyncError> {
        self.ensure_workspace(branch)?;
        Ok(self.ws(branch)?.history.len() as u64)
    }

    /// Log seqs making up a branch, in application order.
    pub fn branch_history(&mut self, branch: BranchId) -> Result<Vec<u64>, SyncError> {
        self.ensure_workspace(branch)?;
        Ok(self.ws(branch)?.history.clone())
    }

    pub fn uncommitted(&mut self, branch: BranchId) -> Result<Vec<ChangeId>, SyncError> {
        self.ensure_workspace(branch)?;
        let ws = self.ws(branch)?;
        Ok(ws
            .uncommitted
            .iter()
            .filter_map(|seq| self.log.get(*seq).map(LogEntry::id))
            .collect())
    }

    /// Drain queued broadcasts. A synced session returns to idle.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        if self.phase == SyncPhase::Synced {
            self.transition(SyncPhase::Idle);
        }
        std::mem::take(&mut self.outbox)
    }

    // ─── Changes ──────────────────────────────────────────────────────

    /// Integrate a change authored on this replica.
    pub fn apply_local_change(&mut self, change: Change) -> Result<Integrated, SyncError> {
        self.guard()?;
        self.transition(SyncPhase::Syncing);
        let id = change.id;
        let branch = self.active;
        let result = self.submit(branch, change);
        if result.is_ok() {
            self.unacked.push(id);
            // Past the staleness window nobody can still build on the change.
            let horizon = self.log.next_seq().saturating_sub(self.config.staleness_window);
            self.unacked
                .retain(|u| self.log.seq_of(u).is_some_and(|seq| seq >= horizon));
        }
        self.settle_phase();
        result
    }

    /// Integrate a change received from another participant.
    ///
    /// It is transformed against every entry its author had not seen,
    /// local unacknowledged changes included.
    pub fn apply_remote_change(&mut self, change: Change) -> Result<Integrated, SyncError> {
        self.guard()?;
        self.transition(SyncPhase::Syncing);
        let branch = self.active;
        let result = self.submit(branch, change);
        self.settle_phase();
        result
    }

    /// Mark a local change as seen by the other participants.
    ///
    /// Called by the transport once peers confirm the change. Changes that
    /// fall behind the staleness window are dropped without one.
    pub fn acknowledge(&mut self, id: &ChangeId) -> bool {
        let before = self.unacked.len();
        self.unacked.retain(|u| u != id);
        before != self.unacked.len()
    }

    /// Integrate a batch of concurrent changes in `(timestamp, author)` order.
    ///
    /// Changes whose dependencies were rejected, held or never seen are held
    /// back; recoverable failures are returned per change.
    pub fn sync_batch(&mut self, changes: Vec<Change>) -> Result<BatchOutcome, SyncError> {
        self.guard()?;
        self.transition(SyncPhase::Syncing);

        let mut ordered = changes;
        ordered.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.author.cmp(&b.author))
        });

        let branch = self.active;
        let mut blocked: HashSet<ChangeId> = HashSet::new();
        let mut outcome = BatchOutcome::default();

        for change in ordered {
            let waiting_on: Vec<ChangeId> = change
                .depends_on
                .iter()
                .filter(|dep| blocked.contains(*dep) || !self.log.contains(dep) || self.is_held(dep))
                .copied()
                .collect();
            if !waiting_on.is_empty() {
                log::debug!("Holding change {} on {} dependencies", change.id, waiting_on.len());
                blocked.insert(change.id);
                outcome.held.push(HeldChange { change, waiting_on });
                continue;
            }

            match self.submit(branch, change.clone()) {
                Ok(Integrated::Applied(effect)) => outcome.applied.push(effect),
                Ok(Integrated::Resolved {
                    conflict,
                    resolution,
                    effect,
                }) => outcome.conflicts.push(ConflictReport {
                    conflict,
                    resolution,
                    effect: Some(effect),
                }),
                Ok(Integrated::Held(conflict)) => {
                    blocked.insert(change.id);
                    outcome.conflicts.push(ConflictReport {
                        conflict,
                        resolution: Resolution::Manual,
                        effect: None,
                    });
                }
                Err(reason) if reason.is_recoverable() => {
                    log::warn!("Rejected change {}: {reason}", change.id);
                    blocked.insert(change.id);
                    outcome.rejected.push(Rejected { change, reason });
                }
                Err(fatal) => {
                    self.settle_phase();
                    return Err(fatal);
                }
            }
        }

        log::debug!(
            "Batch on {}: {} applied, {} conflicts, {} rejected, {} held",
            self.doc_id,
            outcome.applied.len(),
            outcome.conflicts.len(),
            outcome.rejected.len(),
            outcome.held.len()
        );
        self.settle_phase();
        Ok(outcome)
    }

    /// Supply a decision for a pending conflict.
    ///
    /// Conflicts held in the log get their synthetic change appended now;
    /// merge conflicts keep the decision until the merge is retried.
    pub fn resolve_conflict(
        &mut self,
        id: &ConflictId,
        resolution: Resolution,
    ) -> Result<Option<Change>, SyncError> {
        self.guard()?;
        if resolution.is_manual() {
            return Err(SyncError::InvalidResolution(
                "a manual marker is not a decision".into(),
            ));
        }

        if let Some(pending) = self.pending.get(id).cloned() {
            self.transition(SyncPhase::Syncing);
            let result = self
                .resolution_change(
                    pending.branch,
                    &pending.conflict,
                    &resolution,
                    &pending.proposal,
                    StrategyKind::Manual,
                )
                .and_then(|effect| {
                    let disposition = Disposition::Resolved {
                        conflict: id.clone(),
                    };
                    self.append_entry(pending.branch, effect.clone(), Some(effect.clone()), disposition)
                        .map(|_| effect)
                });
            if result.is_ok() {
                self.pending.remove(id);
                log::info!("Conflict {id} resolved manually on {}", self.doc_id);
            }
            self.settle_phase();
            return result.map(Some);
        }

        if let Some(conflict) = self.merge_pending.get(id).map(|b| &b.conflict) {
            if let Resolution::Merged(change) = &resolution {
                change.validate()?;
                if change.target.path != conflict.path() {
                    return Err(SyncError::InvalidResolution(format!(
                        "merged change targets '{}', conflict is on '{}'",
                        change.target.path,
                        conflict.path()
                    )));
                }
            }
            self.merge_pending.remove(id);
            self.merge_decisions.insert(id.clone(), resolution);
            self.settle_phase();
            return Ok(None);
        }

        Err(SyncError::UnknownConflict(id.clone()))
    }

    // ─── Integration ──────────────────────────────────────────────────

    /// Checks shared by every externally submitted change.
    pub(crate) fn submit(
        &mut self,
        branch: BranchId,
        change: Change,
    ) -> Result<Integrated, SyncError> {
        change.validate()?;
        if self.log.contains(&change.id) {
            return Err(ChangeError::DuplicateId(change.id).into());
        }
        let current = self.version_of(branch)?;
        let base = change.base_version;
        if base > current {
            return Err(SyncError::FutureBase { base, current });
        }
        let window = self.config.staleness_window;
        if current - base > window {
            return Err(SyncError::StaleBaseVersion {
                base,
                current,
                window,
            });
        }
        if let Some(missing) = change.depends_on.iter().find(|d| !self.log.contains(d)) {
            return Err(SyncError::MissingDependency(*missing));
        }
        self.integrate(branch, change, true)
    }

    /// Transform `change` onto the branch head and record the outcome.
    pub(crate) fn integrate(
        &mut self,
        branch: BranchId,
        change: Change,
        bridge_own: bool,
    ) -> Result<Integrated, SyncError> {
        self.ensure_workspace(branch)?;
        let history = self.ws(branch)?.history.clone();
        let current = history.len();
        let base = (change.base_version as usize).min(current);

        let mut cache = FormCache::new();
        let (steps, onto, rebased) =
            self.bridge(&history, &change, current, current, bridge_own, &mut cache);
        let last = steps.len() - 1;

        if let Some(effect) = rebased.applied_step(last) {
            let mut effect = effect.clone();
            effect.base_version = current as u64;
            self.append_entry(branch, change, Some(effect.clone()), Disposition::Applied)?;
            log::debug!(
                "Applied {} {} on '{}' at version {}",
                effect.author,
                effect.op.as_str(),
                effect.target.path,
                current + 1
            );
            return Ok(Integrated::Applied(effect));
        }

        // An earlier own step on the path may be the one that clashed; the
        // submitted change stands in for it.
        let found = detect(&steps, &onto, &rebased)
            .into_iter()
            .find(|c| c.path() == change.target.path)
            .ok_or_else(|| SyncError::Corrupted(format!("no outcome for change {}", change.id)))?;

        let mut view = self.log.replay(&history[..base])?;
        for step in &steps {
            view.apply_lenient(step.change());
        }
        let proposal = view.payload_at(&change.target.path);

        let conflict = if found.change_a.id == change.id {
            found
        } else {
            Conflict::new(change.clone(), found.change_b, found.kind)
        };
        let strategy = self.config.strategy;
        let resolution = strategy.strategy().resolve(&conflict);
        log::debug!(
            "Conflict {} ({}) on '{}' -> {:?}",
            conflict.id,
            conflict.kind.as_str(),
            conflict.path(),
            resolution
        );

        if resolution.is_manual() {
            let disposition = Disposition::Held {
                conflict: conflict.clone(),
                proposal: proposal.clone(),
            };
            self.append_entry(branch, change, None, disposition)?;
            log::warn!("Conflict {} on {} needs a manual decision", conflict.id, self.doc_id);
            self.pending.insert(
                conflict.id.clone(),
                PendingConflict {
                    conflict: conflict.clone(),
                    branch,
                    proposal,
                },
            );
            return Ok(Integrated::Held(conflict));
        }

        let effect = self.resolution_change(branch, &conflict, &resolution, &proposal, strategy)?;
        let disposition = Disposition::Resolved {
            conflict: conflict.id.clone(),
        };
        self.append_entry(branch, change, Some(effect.clone()), disposition)?;
        Ok(Integrated::Resolved {
            conflict,
            resolution,
            effect,
        })
    }

    /// Rebase `change` from its base onto `history[..at]`.
    ///
    /// Entries by the same author between the base and `end` are part of the
    /// author's context: those before `at` are bridged, the rest are replayed
    /// ahead of the change. The change itself is always the last step.
    fn bridge(
        &self,
        history: &[u64],
        change: &Change,
        end: usize,
        at: usize,
        bridge_own: bool,
        cache: &mut FormCache,
    ) -> (Vec<Step>, Vec<(u64, Change)>, Rebased) {
        let base = (change.base_version as usize).min(at);
        let mut steps = Vec::new();
        if bridge_own {
            for pos in base..end {
                let seq = history[pos];
                let own = self
                    .log
                    .get(seq)
                    .is_some_and(|entry| is_own(entry, &change.author));
                if !own {
                    continue;
                }
                let Some(form) = self.client_form(history, pos, base, cache) else {
                    continue;
                };
                if pos < at {
                    steps.push(Step::Shared { key: seq, form });
                } else {
                    steps.push(Step::Incoming(form));
                }
            }
        }
        steps.push(Step::Incoming(change.clone()));

        let onto: Vec<(u64, Change)> = history[base..at]
            .iter()
            .filter_map(|seq| {
                self.log
                    .get(*seq)
                    .and_then(|e| e.effect.clone())
                    .map(|effect| (*seq, effect))
            })
            .collect();
        let rebased = ot::rebase(steps.clone(), &onto);
        (steps, onto, rebased)
    }

    /// The entry at `history[pos]` as its author saw it at version `at`.
    fn client_form(
        &self,
        history: &[u64],
        pos: usize,
        at: usize,
        cache: &mut FormCache,
    ) -> Option<Change> {
        if let Some(hit) = cache.get(&(pos, at)) {
            return hit.clone();
        }
        let original = self.log.get(history[pos])?.original.clone();
        let form = if original.base_version as usize >= at {
            Some(original)
        } else {
            let (steps, _, rebased) = self.bridge(history, &original, pos, at, true, cache);
            rebased.applied_step(steps.len() - 1).cloned()
        };
        cache.insert((pos, at), form.clone());
        form
    }

    /// Synthetic change that carries out a decided resolution on `branch`.
    pub(crate) fn resolution_change(
        &mut self,
        branch: BranchId,
        conflict: &Conflict,
        resolution: &Resolution,
        proposal: &Payload,
        strategy: StrategyKind,
    ) -> Result<Change, SyncError> {
        self.ensure_workspace(branch)?;
        let ws = self.ws(branch)?;
        settle(
            conflict,
            resolution,
            proposal,
            &ws.doc,
            ws.history.len() as u64,
            strategy,
        )
    }

    /// Apply, persist and log one entry.
    ///
    /// On a storage failure the workspace is rolled back and nothing is
    /// logged. A failure after the store accepted the entry poisons.
    pub(crate) fn append_entry(
        &mut self,
        branch: BranchId,
        original: Change,
        effect: Option<Change>,
        disposition: Disposition,
    ) -> Result<u64, SyncError> {
        if self.log.contains(&original.id) {
            return Err(ChangeError::DuplicateId(original.id).into());
        }
        self.ensure_workspace(branch)?;
        let seq = self.log.next_seq();
        let ws = self
            .workspaces
            .get_mut(&branch)
            .ok_or_else(|| SyncError::Corrupted(format!("workspace {branch} not loaded")))?;

        let inverse = match &effect {
            Some(e) => Some(ws.doc.apply(e)?),
            None => None,
        };
        let rollback = |ws: &mut Workspace| {
            if let Some(inv) = &inverse {
                if let Err(e) = ws.doc.apply(inv) {
                    log::error!("Rollback failed on branch {branch}: {e}");
                }
            }
        };

        let entry = match LogEntry::new(seq, branch, original, effect, inverse.clone(), disposition)
        {
            Ok(entry) => entry,
            Err(e) => {
                rollback(ws);
                return Err(e.into());
            }
        };
        if let Err(e) = self.store.append_change(self.doc_id, &entry) {
            log::error!("Failed to persist entry {seq} of {}: {e}", self.doc_id);
            rollback(ws);
            return Err(e.into());
        }

        let effect = entry.effect.clone();
        if let Err(e) = self.log.append(entry) {
            let reason = format!("log rejected persisted entry {seq}: {e}");
            self.poison(reason.clone());
            return Err(SyncError::Poisoned(reason));
        }
        ws.history.push(seq);
        ws.uncommitted.push(seq);
        let version = ws.history.len() as u64;

        if let Some(change) = effect {
            self.outbox.push(Outgoing::Change(ChangeBroadcast {
                branch,
                version,
                change,
            }));
        }
        Ok(seq)
    }

    // ─── Workspaces ───────────────────────────────────────────────────

    /// Log seqs contributed by the first-parent chain of `head`.
    pub(crate) fn history_of(&self, head: Option<&CommitId>) -> Result<Vec<u64>, SyncError> {
        let Some(head) = head else {
            return Ok(Vec::new());
        };
        let mut history = Vec::new();
        for commit in self.graph.first_parent_chain(head).into_iter().rev() {
            for id in &commit.change_ids {
                let seq = self.log.seq_of(id).ok_or_else(|| {
                    SyncError::Corrupted(format!("commit {} references unknown change {id}", commit.id))
                })?;
                history.push(seq);
            }
        }
        Ok(history)
    }

    pub(crate) fn ensure_workspace(&mut self, branch: BranchId) -> Result<(), SyncError> {
        if self.workspaces.contains_key(&branch) {
            return Ok(());
        }
        let head = self
            .branches
            .get(&branch)
            .ok_or_else(|| VcsError::UnknownBranch(branch.to_string()))?
            .head
            .clone();
        let mut history = self.history_of(head.as_ref())?;
        let uncommitted: Vec<u64> = self
            .log
            .entries()
            .iter()
            .filter(|e| e.branch == branch && !self.committed.contains(&e.seq))
            .map(|e| e.seq)
            .collect();
        history.extend_from_slice(&uncommitted);
        let doc = self.log.replay(&history)?;
        log::trace!(
            "Materialized branch {branch} of {}: version {}",
            self.doc_id,
            history.len()
        );
        self.workspaces.insert(
            branch,
            Workspace {
                history,
                doc,
                uncommitted,
            },
        );
        Ok(())
    }

    pub(crate) fn ws(&self, branch: BranchId) -> Result<&Workspace, SyncError> {
        self.workspaces
            .get(&branch)
            .ok_or_else(|| SyncError::Corrupted(format!("workspace {branch} not loaded")))
    }

    // ─── State ────────────────────────────────────────────────────────

    fn is_held(&self, id: &ChangeId) -> bool {
        self.pending.values().any(|p| p.conflict.change_a.id == *id)
    }

    pub(crate) fn guard(&self) -> Result<(), SyncError> {
        match &self.poisoned {
            Some(reason) => Err(SyncError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn poison(&mut self, reason: String) {
        log::error!("Document {} poisoned: {reason}", self.doc_id);
        self.poisoned = Some(reason);
    }

    pub(crate) fn transition(&mut self, next: SyncPhase) {
        if self.phase != next {
            log::trace!("Document {}: {:?} -> {:?}", self.doc_id, self.phase, next);
            self.phase = next;
        }
    }

    pub(crate) fn settle_phase(&mut self) {
        if self.pending.is_empty() && self.merge_pending.is_empty() {
            self.transition(SyncPhase::Synced);
        } else {
            self.transition(SyncPhase::Conflicted);
        }
    }
}

fn is_own(entry: &LogEntry, author: &str) -> bool {
    author != SYSTEM_AUTHOR
        && entry.original.author == author
        && entry.disposition == Disposition::Applied
        && entry.effect.is_some()
}

/// Turn a decided resolution into the synthetic change recorded in the log.
///
/// `Chose(A)` writes `proposal` over the node, `Chose(B)` restates the
/// node's current content, `Merged` applies the supplied change.
pub(crate) fn settle(
    conflict: &Conflict,
    resolution: &Resolution,
    proposal: &Payload,
    current: &Document,
    version: u64,
    strategy: StrategyKind,
) -> Result<Change, SyncError> {
    let path = conflict.path();
    let (mut effect, winner) = match resolution {
        Resolution::Chose(Side::A) => (
            Change::replace_node(SYSTEM_AUTHOR, version, path, proposal.clone()),
            Some(conflict.change_a.id),
        ),
        Resolution::Chose(Side::B) => (
            Change::replace_node(SYSTEM_AUTHOR, version, path, current.payload_at(path)),
            Some(conflict.change_b.id),
        ),
        Resolution::Merged(merged) => {
            merged.validate()?;
            if merged.target.path != path {
                return Err(SyncError::InvalidResolution(format!(
                    "merged change targets '{}', conflict is on '{}'",
                    merged.target.path, path
                )));
            }
            (merged.clone().with_id(ChangeId::new()), None)
        }
        Resolution::Manual => {
            return Err(SyncError::InvalidResolution(
                "a manual marker is not a decision".into(),
            ))
        }
    };
    effect.base_version = version;
    effect.resolves = Some(ResolutionRecord {
        conflict: conflict.id.clone(),
        winner,
        strategy,
    });
    Ok(effect)
}
