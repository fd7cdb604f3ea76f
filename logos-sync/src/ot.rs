//! Operational transform core.
//!
//! `transform(a, b)` rewrites `a` so it applies after `b`, where both were
//! created against the same state. For every pair that transforms:
//!
//! ```text
//!   apply(apply(S, b), transform(a, b)) == apply(apply(S, a), transform(b, a))
//! ```
//!
//! Sequence edits are reduced to a footprint `(start, removed, inserted)`:
//!
//! ```text
//!            start          start+removed
//!   ... ─────┼──── removed ─────┼───── ...      then `inserted` chars at start
//! ```
//!
//! | a \ b          | insert-like          | removal                          |
//! |----------------|----------------------|----------------------------------|
//! | insert-like    | shift, tie by order  | before / after / inside = clash  |
//! | removal        | shift                | disjoint shift, delete overlap   |
//! |                |                      | trims, replace overlap = clash   |
//!
//! Whole-node edits on the same path only commute when identical.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems (1989)
//! Reference: Nichols et al. — High-Latency, Low-Bandwidth Windowing in the
//! Jupiter Collaboration System (1995)

use std::collections::HashSet;

use crate::change::{Change, OperationType, Target};
use crate::conflict::ConflictKind;

/// Result of a pairwise transform.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Transformed(Change),
    /// No rule produces a unique outcome; becomes a conflict
    Irreconcilable(ConflictKind),
}

impl TransformOutcome {
    pub fn into_change(self) -> Option<Change> {
        match self {
            TransformOutcome::Transformed(c) => Some(c),
            TransformOutcome::Irreconcilable(_) => None,
        }
    }
}

/// Rewrite `change` so that it applies after `against`.
///
/// The result's `base_version` is advanced by one.
pub fn transform(change: &Change, against: &Change) -> TransformOutcome {
    let next_base = change.base_version.saturating_add(1);
    if change.target.path != against.target.path {
        return TransformOutcome::Transformed(change.rebased(change.target.clone(), next_base));
    }

    match (change.footprint(), against.footprint()) {
        (Some(a), Some(b)) => match transform_ranges(change, a, against, b) {
            Ok((offset, length)) => TransformOutcome::Transformed(change.rebased(
                Target::range(change.target.path.clone(), offset, length),
                next_base,
            )),
            Err(kind) => TransformOutcome::Irreconcilable(kind),
        },
        (None, None) => transform_nodes(change, against, next_base),
        (Some(_), None) if change.is_noop() => TransformOutcome::Transformed(
            change.rebased(Target::range(change.target.path.clone(), 0, 0), next_base),
        ),
        (None, Some(_)) if against.is_noop() => {
            TransformOutcome::Transformed(change.rebased(change.target.clone(), next_base))
        }
        _ => TransformOutcome::Irreconcilable(ConflictKind::StructuralOverlap),
    }
}

fn removal_kind(op: OperationType) -> ConflictKind {
    match op {
        OperationType::Replace => ConflictKind::ReplaceOverlap,
        _ => ConflictKind::StructuralOverlap,
    }
}

fn transform_ranges(
    a: &Change,
    (sa, la, na): (usize, usize, usize),
    b: &Change,
    (sb, lb, nb): (usize, usize, usize),
) -> Result<(usize, usize), ConflictKind> {
    let ea = sa.saturating_add(la);
    let eb = sb.saturating_add(lb);

    if la == 0 && na == 0 {
        let offset = if sa <= sb {
            sa
        } else if sa >= eb {
            (sa - lb).saturating_add(nb)
        } else {
            sb
        };
        return Ok((offset, 0));
    }
    if lb == 0 && nb == 0 {
        return Ok((sa, la));
    }

    match (la == 0, lb == 0) {
        (true, true) => {
            if sa < sb || (sa == sb && a.precedes(b)) {
                Ok((sa, 0))
            } else {
                Ok((sa.saturating_add(nb), 0))
            }
        }
        (true, false) => {
            if sa <= sb {
                Ok((sa, 0))
            } else if sa >= eb {
                Ok(((sa - lb).saturating_add(nb), 0))
            } else {
                Err(removal_kind(b.op))
            }
        }
        (false, true) => {
            if sb <= sa {
                Ok((sa.saturating_add(nb), la))
            } else if sb >= ea {
                Ok((sa, la))
            } else {
                Err(removal_kind(a.op))
            }
        }
        (false, false) => {
            if ea <= sb {
                Ok((sa, la))
            } else if eb <= sa {
                Ok(((sa - lb).saturating_add(nb), la))
            } else if a.op == OperationType::Delete && b.op == OperationType::Delete {
                let overlap = ea.min(eb) - sa.max(sb);
                Ok((sa.min(sb), la - overlap))
            } else {
                Err(ConflictKind::ReplaceOverlap)
            }
        }
    }
}

fn transform_nodes(change: &Change, against: &Change, next_base: u64) -> TransformOutcome {
    if change.op == against.op && change.payload == against.payload {
        return TransformOutcome::Transformed(change.rebased(change.target.clone(), next_base));
    }
    let kind = match (change.op, against.op) {
        (OperationType::Modify, OperationType::Modify) => ConflictKind::ConcurrentModify,
        (OperationType::Delete, OperationType::Modify)
        | (OperationType::Modify, OperationType::Delete) => ConflictKind::DeleteModify,
        _ => ConflictKind::ReplaceOverlap,
    };
    TransformOutcome::Irreconcilable(kind)
}

/// Transform `change` across a sequence of changes applied after its base.
pub fn transform_across<'a>(
    change: &Change,
    history: impl IntoIterator<Item = &'a Change>,
) -> TransformOutcome {
    let mut current = change.clone();
    for applied in history {
        match transform(&current, applied) {
            TransformOutcome::Transformed(next) => current = next,
            clash => return clash,
        }
    }
    TransformOutcome::Transformed(current)
}

// ─── Rebase ───────────────────────────────────────────────────────────

/// One element of a sequence being moved onto another history.
#[derive(Debug, Clone)]
pub enum Step {
    /// A change only the moving side has
    Incoming(Change),
    /// A change the other history already holds as entry `key`, given in the
    /// form the moving side applied it
    Shared { key: u64, form: Change },
}

impl Step {
    pub fn change(&self) -> &Change {
        match self {
            Step::Incoming(c) => c,
            Step::Shared { form, .. } => form,
        }
    }
}

/// First irreconcilable pair found on a path.
#[derive(Debug, Clone, PartialEq)]
pub struct Clash {
    /// Index of the step that failed to transform
    pub step: usize,
    /// Key of the history entry it clashed with
    pub against: u64,
    pub kind: ConflictKind,
    pub path: String,
}

#[derive(Debug, Clone, Default)]
pub struct Rebased {
    /// Incoming steps rewritten to apply after the history, in step order
    pub applied: Vec<(usize, Change)>,
    pub clashes: Vec<Clash>,
    /// Incoming steps on a path that already clashed
    pub absorbed: Vec<usize>,
}

impl Rebased {
    pub fn applied_step(&self, step: usize) -> Option<&Change> {
        self.applied
            .iter()
            .find(|(i, _)| *i == step)
            .map(|(_, c)| c)
    }

    pub fn clash_on(&self, path: &str) -> Option<&Clash> {
        self.clashes.iter().find(|c| c.path == path)
    }
}

/// Move `steps` (a sequence defined on state `S`) onto `onto` (keyed
/// changes also defined on `S`).
///
/// Each step is pushed through the history entries it has not seen while
/// those entries are pulled back over it, so shared entries can be dropped
/// once the moving side reaches them. A clash taints the path: later steps
/// on it are absorbed rather than transformed.
pub fn rebase(steps: Vec<Step>, onto: &[(u64, Change)]) -> Rebased {
    match rebase_until(steps, onto, || false) {
        Some(rebased) => rebased,
        None => Rebased::default(),
    }
}

/// [`rebase`] that checks `stop` before every step; returns `None` when it fires.
pub fn rebase_until(
    steps: Vec<Step>,
    onto: &[(u64, Change)],
    mut stop: impl FnMut() -> bool,
) -> Option<Rebased> {
    let mut outgoing: Vec<(u64, Change)> = onto.to_vec();
    let mut tainted: HashSet<String> = HashSet::new();
    let mut out = Rebased::default();

    for (index, step) in steps.into_iter().enumerate() {
        if stop() {
            return None;
        }
        let path = step.change().target.path.clone();
        match step {
            Step::Shared { key, form } => {
                let Some(pos) = outgoing.iter().position(|(k, _)| *k == key) else {
                    continue;
                };
                if !tainted.contains(&path) {
                    if let Err((against, kind)) = pass_through(form, &mut outgoing[..pos]) {
                        log::trace!("Shared step {index} clashed with entry {against}");
                        tainted.insert(path.clone());
                        out.clashes.push(Clash {
                            step: index,
                            against,
                            kind,
                            path,
                        });
                    }
                }
                outgoing.remove(pos);
            }
            Step::Incoming(change) => {
                if tainted.contains(&path) {
                    out.absorbed.push(index);
                    continue;
                }
                match pass_through(change, &mut outgoing) {
                    Ok(rebased) => out.applied.push((index, rebased)),
                    Err((against, kind)) => {
                        tainted.insert(path.clone());
                        out.clashes.push(Clash {
                            step: index,
                            against,
                            kind,
                            path,
                        });
                    }
                }
            }
        }
    }
    Some(out)
}

/// Push `change` through `outgoing`, transforming each entry over it.
/// `outgoing` is only updated when every pair transforms.
fn pass_through(
    mut change: Change,
    outgoing: &mut [(u64, Change)],
) -> Result<Change, (u64, ConflictKind)> {
    let mut pulled = Vec::with_capacity(outgoing.len());
    for (key, entry) in outgoing.iter() {
        let forward = match transform(&change, entry) {
            TransformOutcome::Transformed(c) => c,
            TransformOutcome::Irreconcilable(kind) => return Err((*key, kind)),
        };
        let backward = match transform(entry, &change) {
            TransformOutcome::Transformed(c) => c,
            TransformOutcome::Irreconcilable(kind) => return Err((*key, kind)),
        };
        pulled.push(backward);
        change = forward;
    }
    for ((_, entry), next) in outgoing.iter_mut().zip(pulled) {
        *entry = next;
    }
    Ok(change)
}
