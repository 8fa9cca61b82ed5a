//! Deterministic per-target conflict resolution.
//!
//! Each target behaves as a last-writer-wins register ordered first by
//! causality, then by wall clock:
//!
//! ```text
//!   partition by target
//!         │
//!         ▼
//!   causal frontier   (ops dominated by no other op on the target)
//!         │
//!         ▼
//!   max (wall_clock, id)  ──► winner
//!   rest of frontier      ──► shadowed (concurrent edits that lost)
//! ```
//!
//! Both the frontier and the `(wall_clock, id)` order are independent of
//! input order, so any permutation of the same operation set yields the
//! same winners on every replica.
//!
//! Losing concurrent edits are discarded from the current value without
//! any merge: two users writing the same cell at the same time keep only
//! one write. They stay in the log and are reported by
//! [`resolve_with_shadows`] so a higher layer can offer manual
//! reconciliation.

use std::collections::BTreeMap;

use crate::operation::{CellValue, OpKind, Operation, OperationId};

/// Outcome for a single target.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Operation,
    /// Concurrent operations that lost the wall-clock tiebreak, best first.
    pub shadowed: Vec<Operation>,
}

impl Resolution {
    pub fn has_conflict(&self) -> bool {
        !self.shadowed.is_empty()
    }

    /// Value of the target after resolution; `None` when the winner is a delete.
    pub fn value(&self) -> Option<&CellValue> {
        match self.winner.kind {
            OpKind::Delete => None,
            _ => self.winner.value.as_ref(),
        }
    }
}

/// Winner per target.
pub fn resolve<'a, I>(ops: I) -> BTreeMap<String, Operation>
where
    I: IntoIterator<Item = &'a Operation>,
{
    resolve_with_shadows(ops)
        .into_iter()
        .map(|(target, resolution)| (target, resolution.winner))
        .collect()
}

/// Winner for one target, if any operation touches it.
pub fn resolve_target<'a, I>(ops: I, target: &str) -> Option<Operation>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let partition: Vec<&Operation> = ops.into_iter().filter(|op| op.target == target).collect();
    resolve_partition(partition).map(|r| r.winner)
}

/// Winner plus shadowed concurrent losers, per target.
pub fn resolve_with_shadows<'a, I>(ops: I) -> BTreeMap<String, Resolution>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut partitions: BTreeMap<&str, Vec<&Operation>> = BTreeMap::new();
    for op in ops {
        partitions.entry(op.target.as_str()).or_default().push(op);
    }

    partitions
        .into_iter()
        .filter_map(|(target, partition)| {
            resolve_partition(partition).map(|r| (target.to_string(), r))
        })
        .collect()
}

/// Only the targets whose current value hides at least one concurrent edit.
pub fn conflicts<'a, I>(ops: I) -> BTreeMap<String, Resolution>
where
    I: IntoIterator<Item = &'a Operation>,
{
    resolve_with_shadows(ops)
        .into_iter()
        .filter(|(_, r)| r.has_conflict())
        .collect()
}

fn resolve_partition(partition: Vec<&Operation>) -> Option<Resolution> {
    // Redelivered copies share an id; keep one.
    let unique: BTreeMap<OperationId, &Operation> =
        partition.into_iter().map(|op| (op.id, op)).collect();
    let candidates: Vec<&Operation> = unique.values().copied().collect();

    let mut frontier: Vec<&Operation> = candidates
        .iter()
        .copied()
        .filter(|op| {
            !candidates
                .iter()
                .any(|other| other.vector_clock.dominates(&op.vector_clock))
        })
        .collect();

    frontier.sort_by(|a, b| lww_key(b).cmp(&lww_key(a)));
    let mut frontier = frontier.into_iter();
    let winner = frontier.next()?.clone();
    let shadowed = frontier.cloned().collect();

    Some(Resolution { winner, shadowed })
}

/// Total order among concurrent operations: later wall clock wins, and
/// the operation id settles exact wall-clock ties.
fn lww_key(op: &Operation) -> (u64, OperationId) {
    (op.wall_clock, op.id)
}
