//! Append-only, deduplicated operation log for one session.
//!
//! ```text
//! local edit ──► apply_local ──► ClockStore::increment ──► stamp ──► append ──► publish
//! transport  ──► apply_remote ──► dedup(id) ──► validate ──► append ──► ClockStore::merge
//! ```
//!
//! The log keeps arrival order and never reorders or rewrites an entry.
//! Arrival order differs between replicas; the "current value" of a target
//! is computed by [`crate::resolver`], which does not depend on it.

use std::collections::{HashMap, VecDeque};

use crate::clock::{wall_clock_ms, ClockStore, ReplicaId, VectorClock};
use crate::operation::{OpDraft, Operation, OperationError, OperationId, MAX_DEPENDENCIES};

/// Operation log plus the session's vector clock.
#[derive(Debug)]
pub struct OperationLog {
    replica_id: ReplicaId,
    clock: ClockStore,
    /// Arrival order.
    operations: Vec<Operation>,
    /// id → position in `operations`
    index: HashMap<OperationId, usize>,
    /// Most recent ids per target, oldest first, capped at MAX_DEPENDENCIES.
    recent_by_target: HashMap<String, VecDeque<OperationId>>,
}

impl OperationLog {
    /// Create an empty log for the local replica.
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            clock: ClockStore::new(),
            operations: Vec::new(),
            index: HashMap::new(),
            recent_by_target: HashMap::new(),
        }
    }

    /// Stamp and append a local edit using the system wall clock.
    pub fn apply_local(&mut self, draft: OpDraft) -> Result<Operation, OperationError> {
        self.apply_local_at(draft, wall_clock_ms())
    }

    /// Stamp and append a local edit with an explicit wall clock.
    ///
    /// Returns the fully formed operation for the caller to publish.
    /// A malformed draft is refused without touching the clock or the log.
    pub fn apply_local_at(
        &mut self,
        draft: OpDraft,
        wall_clock: u64,
    ) -> Result<Operation, OperationError> {
        let mut vector_clock = self.clock.current().clone();
        let logical = vector_clock
            .increment(&self.replica_id)
            .ok_or_else(|| OperationError::ClockOverflow { replica: self.replica_id.clone() })?;

        let op = Operation {
            id: OperationId::derive(&self.replica_id, logical, OperationId::random_salt()),
            kind: draft.kind,
            dependencies: self.dependencies_for(&draft.target),
            target: draft.target,
            position: draft.position,
            value: draft.value,
            replica_id: self.replica_id.clone(),
            wall_clock,
            vector_clock,
        };
        op.validate()?;

        self.clock.merge(&op.vector_clock);
        self.append(op.clone());
        log::debug!("Applied local op {} on {} at {}", op.id, op.target, logical);
        Ok(op)
    }

    /// Apply an operation received from another replica.
    ///
    /// `Ok(false)` means the id was already in the log (redelivery) and
    /// nothing changed. `Ok(true)` means it was appended and the caller
    /// should notify observers. Malformed operations are refused with
    /// the log and clock untouched.
    pub fn apply_remote(&mut self, op: Operation) -> Result<bool, OperationError> {
        if self.index.contains_key(&op.id) {
            log::trace!("Dropping duplicate op {}", op.id);
            return Ok(false);
        }
        op.validate()?;

        self.clock.merge(&op.vector_clock);
        log::debug!("Applied remote op {} from {} on {}", op.id, op.replica_id, op.target);
        self.append(op);
        Ok(true)
    }

    /// Last ≤5 operation ids that touched `target`, oldest first.
    pub fn dependencies_for(&self, target: &str) -> Vec<OperationId> {
        self.recent_by_target
            .get(target)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn append(&mut self, op: Operation) {
        let recent = self.recent_by_target.entry(op.target.clone()).or_default();
        recent.push_back(op.id);
        while recent.len() > MAX_DEPENDENCIES {
            recent.pop_front();
        }
        self.index.insert(op.id, self.operations.len());
        self.operations.push(op);
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.index.get(id).map(|&i| &self.operations[i])
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.index.contains_key(id)
    }

    /// All operations in arrival order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Operations on one target, arrival order.
    pub fn operations_for<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = &'a Operation> + 'a {
        self.operations.iter().filter(move |op| op.target == target)
    }

    /// The session's current vector clock.
    pub fn clock(&self) -> &VectorClock {
        self.clock.current()
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Drop every operation and reset the clock.
    pub fn clear(&mut self) {
        self.operations.clear();
        self.index.clear();
        self.recent_by_target.clear();
        self.clock.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{CellValue, OpKind};

    fn log_for(replica: &str) -> OperationLog {
        OperationLog::new(ReplicaId::from(replica))
    }

    #[test]
    fn test_apply_local_stamps_operation() {
        let mut log = log_for("alice");
        let op = log.apply_local_at(OpDraft::update("C1", "x"), 1_000).unwrap();

        assert_eq!(op.kind, OpKind::Update);
        assert_eq!(op.replica_id, ReplicaId::from("alice"));
        assert_eq!(op.wall_clock, 1_000);
        assert_eq!(op.logical_time(), 1);
        assert!(op.dependencies.is_empty());
        assert_eq!(log.len(), 1);
        assert_eq!(log.clock().get(&ReplicaId::from("alice")), 1);
    }

    #[test]
    fn test_apply_local_increments_clock() {
        let mut log = log_for("alice");
        let a = log.apply_local_at(OpDraft::update("C1", "x"), 1).unwrap();
        let b = log.apply_local_at(OpDraft::update("C2", "y"), 2).unwrap();
        assert_eq!(a.logical_time(), 1);
        assert_eq!(b.logical_time(), 2);
        assert!(b.vector_clock.dominates(&a.vector_clock));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_apply_local_records_dependencies() {
        let mut log = log_for("alice");
        let first = log.apply_local_at(OpDraft::update("C1", "a"), 1).unwrap();
        let _other = log.apply_local_at(OpDraft::update("C2", "b"), 2).unwrap();
        let second = log.apply_local_at(OpDraft::update("C1", "c"), 3).unwrap();
        assert_eq!(second.dependencies, vec![first.id]);
    }

    #[test]
    fn test_malformed_local_draft_leaves_state_untouched() {
        let mut log = log_for("alice");
        let draft = OpDraft {
            kind: OpKind::Update,
            target: "C1".into(),
            position: 0,
            value: None,
        };
        assert!(log.apply_local_at(draft, 1).is_err());
        assert!(log.is_empty());
        assert!(log.clock().is_empty());
    }

    #[test]
    fn test_apply_remote_dedup() {
        let mut alice = log_for("alice");
        let mut bob = log_for("bob");
        let op = alice.apply_local_at(OpDraft::update("C1", "x"), 1).unwrap();

        assert!(bob.apply_remote(op.clone()).unwrap());
        let clock_after_first = bob.clock().clone();
        assert!(!bob.apply_remote(op).unwrap());
        assert_eq!(bob.len(), 1);
        assert_eq!(bob.clock(), &clock_after_first);
    }

    #[test]
    fn test_apply_remote_merges_clock() {
        let mut alice = log_for("alice");
        let mut bob = log_for("bob");
        let op = alice.apply_local_at(OpDraft::update("C1", "x"), 1).unwrap();
        bob.apply_remote(op).unwrap();

        let next = bob.apply_local_at(OpDraft::update("C1", "y"), 2).unwrap();
        assert_eq!(next.vector_clock.get(&ReplicaId::from("alice")), 1);
        assert_eq!(next.vector_clock.get(&ReplicaId::from("bob")), 1);
    }

    #[test]
    fn test_apply_remote_rejects_malformed() {
        let mut alice = log_for("alice");
        let mut bob = log_for("bob");
        let mut op = alice.apply_local_at(OpDraft::update("C1", "x"), 1).unwrap();
        op.vector_clock = VectorClock::new();

        assert!(bob.apply_remote(op.clone()).is_err());
        assert!(bob.is_empty());
        assert!(bob.clock().is_empty());
        assert!(!bob.contains(&op.id));
    }

    #[test]
    fn test_apply_remote_rejects_exhausted_clock() {
        let mut alice = log_for("alice");
        let mut bob = log_for("bob");
        let mut op = bob.apply_local_at(OpDraft::update("C1", "x"), 1).unwrap();
        let forged: VectorClock = [(ReplicaId::from("alice"), u64::MAX)].into_iter().collect();
        op.vector_clock.merge(&forged);

        assert!(matches!(
            alice.apply_remote(op.clone()),
            Err(OperationError::ClockOverflow { .. })
        ));
        assert!(alice.is_empty());
        assert!(alice.clock().is_empty());

        let next = alice.apply_local_at(OpDraft::update("C1", "y"), 2).unwrap();
        assert_eq!(next.logical_time(), 1);
        assert_eq!(alice.len(), 1);
    }

    #[test]
    fn test_dependencies_capped_at_five_oldest_dropped() {
        let mut log = log_for("alice");
        let ids: Vec<OperationId> = (0..8)
            .map(|i| {
                log.apply_local_at(OpDraft::update("C1", CellValue::Integer(i)), i as u64)
                    .unwrap()
                    .id
            })
            .collect();

        let deps = log.dependencies_for("C1");
        assert_eq!(deps.len(), 5);
        assert_eq!(deps, ids[3..].to_vec());
        assert!(log.operations().iter().all(|op| op.dependencies.len() <= 5));
    }

    #[test]
    fn test_dependencies_for_unknown_target_empty() {
        let log = log_for("alice");
        assert!(log.dependencies_for("nope").is_empty());
    }

    #[test]
    fn test_clear() {
        let mut log = log_for("alice");
        log.apply_local_at(OpDraft::update("C1", "x"), 1).unwrap();
        log.clear();
        assert!(log.is_empty());
        assert!(log.dependencies_for("C1").is_empty());
        assert!(log.clock().is_empty());
    }

    #[test]
    fn test_get_and_operations_for() {
        let mut log = log_for("alice");
        let a = log.apply_local_at(OpDraft::update("C1", "x"), 1).unwrap();
        log.apply_local_at(OpDraft::update("C2", "y"), 2).unwrap();
        assert_eq!(log.get(&a.id), Some(&a));
        assert_eq!(log.operations_for("C1").count(), 1);
    }
}
