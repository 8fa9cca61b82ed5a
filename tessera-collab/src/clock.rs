//! Vector clocks for causal ordering between replicas.
//!
//! Every session keeps one [`ClockStore`]. Local edits bump the local
//! replica's counter; every observed operation (local or remote) is merged
//! pointwise with `max`, so counters never decrease.
//!
//! ```text
//!   replica A          replica B
//!   {A:1}              {B:1}
//!     │   ── op ──►      │
//!     │                merge → {A:1, B:1}
//!     │                increment → {A:1, B:2}   (dominates both)
//! ```
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Capturing the happens-before relationship)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock in milliseconds since the Unix epoch.
///
/// Only ever used as a tiebreak between concurrent operations.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identity of one connected editor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Causal relationship of one clock relative to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Strictly happened before the other clock.
    Before,
    /// Strictly happened after the other clock.
    After,
    /// Identical counters.
    Equal,
    /// Neither dominates: no causal relationship.
    Concurrent,
}

/// Mapping replica → counter. Absent entries read as 0.
///
/// Backed by a `BTreeMap` so that encoding and iteration order are
/// identical on every replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `replica`, 0 if never seen.
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Bump `replica`'s counter by one and return the new value.
    ///
    /// `None` if the counter is already at `u64::MAX`; the clock is left
    /// unchanged.
    pub fn increment(&mut self, replica: &ReplicaId) -> Option<u64> {
        let next = self.get(replica).checked_add(1)?;
        self.entries.insert(replica.clone(), next);
        Some(next)
    }

    /// First replica whose counter can no longer be incremented.
    pub fn saturated_entry(&self) -> Option<&ReplicaId> {
        self.entries
            .iter()
            .find(|&(_, &counter)| counter == u64::MAX)
            .map(|(replica, _)| replica)
    }

    /// Pointwise max of `self` and `other`, stored into `self`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &remote) in &other.entries {
            let local = self.entries.entry(replica.clone()).or_insert(0);
            if remote > *local {
                *local = remote;
            }
        }
    }

    /// `true` iff every counter in `self` is ≥ the one in `other` and at
    /// least one is strictly greater.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        let covers = other
            .entries
            .iter()
            .all(|(replica, &theirs)| self.get(replica) >= theirs);
        if !covers {
            return false;
        }
        self.entries
            .iter()
            .any(|(replica, &ours)| ours > other.get(replica))
    }

    /// Full causal comparison.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        if self.dominates(other) {
            Causality::After
        } else if other.dominates(self) {
            Causality::Before
        } else if self.is_equivalent(other) {
            Causality::Equal
        } else {
            Causality::Concurrent
        }
    }

    /// Partial order view of [`compare`](Self::compare); `None` when concurrent.
    pub fn partial_cmp_causal(&self, other: &VectorClock) -> Option<Ordering> {
        match self.compare(other) {
            Causality::Before => Some(Ordering::Less),
            Causality::After => Some(Ordering::Greater),
            Causality::Equal => Some(Ordering::Equal),
            Causality::Concurrent => None,
        }
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == Causality::Concurrent
    }

    /// Equal once explicit zero entries are ignored.
    fn is_equivalent(&self, other: &VectorClock) -> bool {
        self.entries
            .keys()
            .chain(other.entries.keys())
            .all(|replica| self.get(replica) == other.get(replica))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.entries.iter().map(|(r, c)| (r, *c))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all counters: the number of operations this clock has seen.
    pub fn total(&self) -> u64 {
        self.entries.values().sum()
    }
}

impl FromIterator<(ReplicaId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<(&'a str, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (&'a str, u64)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(r, c)| (ReplicaId::from(r), c))
            .collect()
    }
}

/// Free-function form of [`VectorClock::dominates`].
pub fn dominates(a: &VectorClock, b: &VectorClock) -> bool {
    a.dominates(b)
}

/// The session's vector clock.
///
/// Owned by the operation log; one per session.
#[derive(Debug, Default)]
pub struct ClockStore {
    current: VectorClock,
}

impl ClockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump `replica` and return a snapshot of the whole clock.
    pub fn increment(&mut self, replica: &ReplicaId) -> Option<VectorClock> {
        self.current.increment(replica)?;
        Some(self.current.clone())
    }

    /// Merge a remote snapshot into the session clock.
    pub fn merge(&mut self, remote: &VectorClock) {
        self.current.merge(remote);
    }

    pub fn current(&self) -> &VectorClock {
        &self.current
    }

    pub fn clear(&mut self) {
        self.current = VectorClock::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_absent_entry_reads_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get(&ReplicaId::from("a")), 0);
    }

    #[test]
    fn test_increment_only_touches_one_replica() {
        let mut store = ClockStore::new();
        let a = ReplicaId::from("a");
        let b = ReplicaId::from("b");
        store.merge(&vc(&[("b", 4)]));

        let snapshot = store.increment(&a).unwrap();
        assert_eq!(snapshot.get(&a), 1);
        assert_eq!(snapshot.get(&b), 4);

        let snapshot = store.increment(&a).unwrap();
        assert_eq!(snapshot.get(&a), 2);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut store = ClockStore::new();
        let a = ReplicaId::from("a");
        let snapshot = store.increment(&a).unwrap();
        store.increment(&a).unwrap();
        assert_eq!(snapshot.get(&a), 1);
        assert_eq!(store.current().get(&a), 2);
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let mut clock = vc(&[("a", 3), ("b", 1)]);
        clock.merge(&vc(&[("a", 1), ("b", 5), ("c", 2)]));
        assert_eq!(clock, vc(&[("a", 3), ("b", 5), ("c", 2)]));
    }

    #[test]
    fn test_dominates_strict() {
        let a = vc(&[("a", 2), ("b", 1)]);
        let b = vc(&[("a", 1), ("b", 1)]);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(!a.dominates(&a.clone()));
    }

    #[test]
    fn test_dominates_with_missing_entries() {
        let a = vc(&[("a", 1)]);
        let empty = VectorClock::new();
        assert!(a.dominates(&empty));
        assert!(!empty.dominates(&a));
        // explicit zero is the same as absent
        assert!(!vc(&[("a", 0)]).dominates(&empty));
    }

    #[test]
    fn test_compare_concurrent() {
        let a = vc(&[("a", 1)]);
        let b = vc(&[("b", 1)]);
        assert_eq!(a.compare(&b), Causality::Concurrent);
        assert!(a.is_concurrent_with(&b));
        assert_eq!(a.partial_cmp_causal(&b), None);
    }

    #[test]
    fn test_compare_equal_ignores_zero_entries() {
        let a = vc(&[("a", 1), ("b", 0)]);
        let b = vc(&[("a", 1)]);
        assert_eq!(a.compare(&b), Causality::Equal);
    }

    #[test]
    fn test_compare_before_after() {
        let early = vc(&[("a", 1)]);
        let late = vc(&[("a", 2)]);
        assert_eq!(early.compare(&late), Causality::Before);
        assert_eq!(late.compare(&early), Causality::After);
        assert!(dominates(&late, &early));
    }

    #[test]
    fn test_increment_overflow_leaves_clock_unchanged() {
        let mut clock = vc(&[("a", u64::MAX), ("b", 2)]);
        assert_eq!(clock.saturated_entry(), Some(&ReplicaId::from("a")));
        assert_eq!(clock.increment(&ReplicaId::from("a")), None);
        assert_eq!(clock, vc(&[("a", u64::MAX), ("b", 2)]));
        assert_eq!(clock.increment(&ReplicaId::from("b")), Some(3));
        assert_eq!(vc(&[("b", 3)]).saturated_entry(), None);
    }

    #[test]
    fn test_clear_resets() {
        let mut store = ClockStore::new();
        store.increment(&ReplicaId::from("a")).unwrap();
        store.clear();
        assert!(store.current().is_empty());
    }

    #[test]
    fn test_total() {
        assert_eq!(vc(&[("a", 2), ("b", 3)]).total(), 5);
    }
}
