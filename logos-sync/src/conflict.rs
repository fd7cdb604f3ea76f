//! Conflict detection and pluggable resolution.
//!
//! A [`Conflict`] pairs two changes on the same target whose transform is
//! irreconcilable. A [`ResolutionStrategy`] turns it into a [`Resolution`]:
//!
//! | Strategy          | Outcome                                              |
//! |-------------------|------------------------------------------------------|
//! | `LastWriteWins`   | later `(timestamp, author)` wins                     |
//! | `ServerPreferred` | side with `Origin::Server` wins, else last write     |
//! | `LocalPreferred`  | side with `Origin::Local` wins, else last write      |
//! | `MergeValues`     | JSON objects are deep-merged, else last write        |
//! | `Manual`          | pending until a human decides                        |
//!
//! Strategies are selected through [`StrategyKind`] in configuration.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::change::{now_millis, Change, ChangeId, Origin, Payload};
use crate::ot::{Rebased, Step};

/// Author recorded on changes the engine synthesizes.
pub const SYSTEM_AUTHOR: &str = "logos-sync";

/// Deterministic conflict identity derived from the two change ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(pub String);

impl ConflictId {
    pub fn of(a: ChangeId, b: ChangeId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(lo.0.as_bytes());
        hasher.update(hi.0.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why two changes could not be transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Both set the same structured field to different values
    ConcurrentModify,
    /// One removed a node the other modified
    DeleteModify,
    /// Edits disagree on the node's shape (insert inside a removed range,
    /// range edit against a whole-node edit)
    StructuralOverlap,
    /// A replace overlaps another edit of the same content
    ReplaceOverlap,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::ConcurrentModify => "concurrent_modify",
            ConflictKind::DeleteModify => "delete_modify",
            ConflictKind::StructuralOverlap => "structural_overlap",
            ConflictKind::ReplaceOverlap => "replace_overlap",
        }
    }
}

/// Which change of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

/// Two changes that cannot both take effect as written.
///
/// Inside the engine `change_a` is always the incoming (or merging) change
/// and `change_b` the one already in the history it meets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub change_a: Change,
    pub change_b: Change,
    pub kind: ConflictKind,
    pub detected_at: u64,
}

impl Conflict {
    pub fn new(change_a: Change, change_b: Change, kind: ConflictKind) -> Self {
        Self {
            id: ConflictId::of(change_a.id, change_b.id),
            change_a,
            change_b,
            kind,
            detected_at: now_millis(),
        }
    }

    pub fn path(&self) -> &str {
        &self.change_a.target.path
    }

    pub fn side(&self, side: Side) -> &Change {
        match side {
            Side::A => &self.change_a,
            Side::B => &self.change_b,
        }
    }

    pub fn involves(&self, id: &ChangeId) -> bool {
        self.change_a.id == *id || self.change_b.id == *id
    }

    /// Side that is later in `(timestamp, author, id)` order.
    pub fn latest(&self) -> Side {
        match self.change_a.order_cmp(&self.change_b) {
            Ordering::Greater => Side::A,
            _ => Side::B,
        }
    }
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A new change that combines both sides
    Merged(Change),
    /// One side wins outright
    Chose(Side),
    /// Needs human input
    Manual,
}

impl Resolution {
    pub fn is_manual(&self) -> bool {
        matches!(self, Resolution::Manual)
    }
}

/// Named strategies, selectable per document or per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StrategyKind {
    #[default]
    LastWriteWins,
    ServerPreferred,
    LocalPreferred,
    MergeValues,
    Manual,
}

impl StrategyKind {
    pub fn strategy(&self) -> &'static dyn ResolutionStrategy {
        static LWW: LastWriteWins = LastWriteWins;
        static SERVER: ServerPreferred = ServerPreferred;
        static LOCAL: LocalPreferred = LocalPreferred;
        static MERGE: MergeValues = MergeValues;
        static MANUAL: Manual = Manual;
        match self {
            StrategyKind::LastWriteWins => &LWW,
            StrategyKind::ServerPreferred => &SERVER,
            StrategyKind::LocalPreferred => &LOCAL,
            StrategyKind::MergeValues => &MERGE,
            StrategyKind::Manual => &MANUAL,
        }
    }
}

/// Audit trail carried by every synthetic resolution change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub conflict: ConflictId,
    /// Winning change, `None` when both sides were merged
    pub winner: Option<ChangeId>,
    pub strategy: StrategyKind,
}

pub trait ResolutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

pub struct LastWriteWins;

impl ResolutionStrategy for LastWriteWins {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LastWriteWins
    }

    fn resolve(&self, conflict: &Conflict) -> Resolution {
        Resolution::Chose(conflict.latest())
    }
}

pub struct ServerPreferred;

impl ResolutionStrategy for ServerPreferred {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ServerPreferred
    }

    fn resolve(&self, conflict: &Conflict) -> Resolution {
        prefer_origin(conflict, Origin::Server)
    }
}

pub struct LocalPreferred;

impl ResolutionStrategy for LocalPreferred {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LocalPreferred
    }

    fn resolve(&self, conflict: &Conflict) -> Resolution {
        prefer_origin(conflict, Origin::Local)
    }
}

fn prefer_origin(conflict: &Conflict, origin: Origin) -> Resolution {
    let a = conflict.change_a.origin == origin;
    let b = conflict.change_b.origin == origin;
    match (a, b) {
        (true, false) => Resolution::Chose(Side::A),
        (false, true) => Resolution::Chose(Side::B),
        _ => Resolution::Chose(conflict.latest()),
    }
}

pub struct Manual;

impl ResolutionStrategy for Manual {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Manual
    }

    fn resolve(&self, _conflict: &Conflict) -> Resolution {
        Resolution::Manual
    }
}

/// Deep-merges two JSON objects; the later side wins on scalar keys.
pub struct MergeValues;

impl ResolutionStrategy for MergeValues {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MergeValues
    }

    fn resolve(&self, conflict: &Conflict) -> Resolution {
        let objects = match (&conflict.change_a.payload, &conflict.change_b.payload) {
            (Payload::Value(a), Payload::Value(b)) if a.is_object() && b.is_object() => {
                Some((a, b))
            }
            _ => None,
        };
        let Some((a, b)) = objects else {
            return Resolution::Chose(conflict.latest());
        };

        let (early, late) = match conflict.latest() {
            Side::A => (b, a),
            Side::B => (a, b),
        };
        let mut merged = early.clone();
        deep_merge(&mut merged, late);

        let basis = conflict.side(conflict.latest());
        Resolution::Merged(Change::modify(
            SYSTEM_AUTHOR,
            basis.base_version,
            conflict.path(),
            merged,
        ))
    }
}

fn deep_merge(into: &mut serde_json::Value, from: &serde_json::Value) {
    match (into, from) {
        (serde_json::Value::Object(dst), serde_json::Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dst.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Conflicts behind the clashes of a rebase, in clash order.
///
/// `steps` and `onto` must be the input `rebased` was computed from. Each
/// conflict pairs the step that failed to transform (side A) with the
/// history entry it ran into (side B).
pub fn detect(steps: &[Step], onto: &[(u64, Change)], rebased: &Rebased) -> Vec<Conflict> {
    let mut seen = HashSet::new();
    let mut conflicts = Vec::with_capacity(rebased.clashes.len());
    for clash in &rebased.clashes {
        let incoming = steps.get(clash.step).map(Step::change);
        let existing = onto
            .iter()
            .find(|(key, _)| *key == clash.against)
            .map(|(_, change)| change);
        let (Some(incoming), Some(existing)) = (incoming, existing) else {
            log::error!(
                "Clash on '{}' refers to step {} / entry {} outside the rebase",
                clash.path,
                clash.step,
                clash.against
            );
            continue;
        };
        let conflict = Conflict::new(incoming.clone(), existing.clone(), clash.kind);
        if seen.insert(conflict.id.clone()) {
            log::debug!(
                "Conflict {} ({}) on '{}'",
                conflict.id,
                clash.kind.as_str(),
                conflict.path()
            );
            conflicts.push(conflict);
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn modify(author: &str, ts: u64, value: serde_json::Value) -> Change {
        Change::modify(author, 3, "title", value).with_timestamp(ts)
    }

    #[test]
    fn test_conflict_id_is_order_independent() {
        let a = ChangeId::new();
        let b = ChangeId::new();
        assert_eq!(ConflictId::of(a, b), ConflictId::of(b, a));
        assert_ne!(ConflictId::of(a, b), ConflictId::of(a, ChangeId::new()));
    }

    #[test]
    fn test_last_write_wins() {
        let c = Conflict::new(
            modify("bob", 200, json!("B")),
            modify("alice", 100, json!("A")),
            ConflictKind::ConcurrentModify,
        );
        assert_eq!(LastWriteWins.resolve(&c), Resolution::Chose(Side::A));

        let c = Conflict::new(
            modify("alice", 100, json!("A")),
            modify("bob", 200, json!("B")),
            ConflictKind::ConcurrentModify,
        );
        assert_eq!(LastWriteWins.resolve(&c), Resolution::Chose(Side::B));
    }

    #[test]
    fn test_last_write_wins_tie_on_author() {
        let c = Conflict::new(
            modify("bob", 100, json!("B")),
            modify("alice", 100, json!("A")),
            ConflictKind::ConcurrentModify,
        );
        assert_eq!(LastWriteWins.resolve(&c), Resolution::Chose(Side::A));
    }

    #[test]
    fn test_origin_preference() {
        let server = modify("srv", 100, json!("S")).with_origin(Origin::Server);
        let local = modify("me", 200, json!("L")).with_origin(Origin::Local);
        let c = Conflict::new(local.clone(), server.clone(), ConflictKind::ConcurrentModify);
        assert_eq!(ServerPreferred.resolve(&c), Resolution::Chose(Side::B));
        assert_eq!(LocalPreferred.resolve(&c), Resolution::Chose(Side::A));

        // same origin on both sides falls back to last write
        let remote_a = modify("x", 300, json!(1)).with_origin(Origin::Remote);
        let remote_b = modify("y", 100, json!(2)).with_origin(Origin::Remote);
        let c = Conflict::new(remote_a, remote_b, ConflictKind::ConcurrentModify);
        assert_eq!(ServerPreferred.resolve(&c), Resolution::Chose(Side::A));
    }

    #[test]
    fn test_manual_is_pending() {
        let c = Conflict::new(
            modify("a", 1, json!(1)),
            modify("b", 2, json!(2)),
            ConflictKind::ConcurrentModify,
        );
        assert!(Manual.resolve(&c).is_manual());
        assert!(StrategyKind::Manual.strategy().resolve(&c).is_manual());
    }

    #[test]
    fn test_merge_values_deep_merges_objects() {
        let early = modify("a", 1, json!({"style": {"bold": true}, "size": 10}));
        let late = modify("b", 2, json!({"style": {"italic": true}, "size": 12}));
        let c = Conflict::new(late, early, ConflictKind::ConcurrentModify);
        match MergeValues.resolve(&c) {
            Resolution::Merged(change) => {
                assert_eq!(
                    change.payload,
                    Payload::Value(json!({
                        "style": {"bold": true, "italic": true},
                        "size": 12
                    }))
                );
                assert_eq!(change.target.path, "title");
                assert_eq!(change.author, SYSTEM_AUTHOR);
            }
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_values_falls_back_for_scalars() {
        let c = Conflict::new(
            modify("a", 5, json!("x")),
            modify("b", 1, json!("y")),
            ConflictKind::ConcurrentModify,
        );
        assert_eq!(MergeValues.resolve(&c), Resolution::Chose(Side::A));
    }

    fn detect_against(incoming: Change, history: Vec<Change>) -> Vec<Conflict> {
        let onto: Vec<(u64, Change)> = history
            .into_iter()
            .enumerate()
            .map(|(i, c)| (i as u64, c))
            .collect();
        let steps = vec![Step::Incoming(incoming)];
        let rebased = crate::ot::rebase(steps.clone(), &onto);
        detect(&steps, &onto, &rebased)
    }

    #[test]
    fn test_detect_concurrent_modifies() {
        let a = modify("alice", 1, json!("A"));
        let b = modify("bob", 2, json!("B"));
        let other_path = Change::modify("carol", 3, "body", json!(1));
        let conflicts = detect_against(b.clone(), vec![other_path, a.clone()]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::ConcurrentModify);
        assert_eq!(conflicts[0].change_a.id, b.id);
        assert_eq!(conflicts[0].change_b.id, a.id);
    }

    #[test]
    fn test_detect_ignores_transformable_edits() {
        let ins_a = Change::insert("alice", 0, "body", 0, "x");
        let ins_b = Change::insert("bob", 0, "body", 0, "y");
        assert!(detect_against(ins_b, vec![ins_a]).is_empty());

        let same = modify("bob", 2, json!(1));
        assert!(detect_against(same, vec![modify("alice", 1, json!(1))]).is_empty());
    }

    #[test]
    fn test_detect_delete_vs_modify() {
        let del = Change::delete_node("alice", 3, "title").with_timestamp(5);
        let m = modify("bob", 6, json!("B"));
        let conflicts = detect_against(m, vec![del]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::DeleteModify);
    }

    #[test]
    fn test_detect_only_reports_first_clash_per_path() {
        let first = modify("bob", 6, json!("B"));
        let second = modify("bob", 7, json!("C"));
        let onto = vec![(0, modify("alice", 5, json!("A")))];
        let steps = vec![Step::Incoming(first.clone()), Step::Incoming(second)];
        let rebased = crate::ot::rebase(steps.clone(), &onto);
        let conflicts = detect(&steps, &onto, &rebased);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].change_a.id, first.id);
        assert_eq!(rebased.absorbed, vec![1]);
    }
}
