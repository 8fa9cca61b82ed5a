//! Immutable edit records exchanged between replicas.
//!
//! An [`Operation`] is created exactly once, by [`OperationLog::apply_local`]
//! on the originating replica, and then travels unchanged to every other
//! replica. Nothing downstream ever mutates one.
//!
//! [`OperationLog::apply_local`]: crate::oplog::OperationLog::apply_local

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::clock::{ReplicaId, VectorClock};

/// Upper bound on causal-dependency hints carried by one operation.
pub const MAX_DEPENDENCIES: usize = 5;

/// Namespace for deriving operation ids (UUIDv5).
const OPERATION_NAMESPACE: Uuid = Uuid::from_u128(0x7e55_e4a0_c011_4ab5_9d1e_0b5e_2a11_ce11);

/// Globally unique operation id.
///
/// Derived from (replica, logical timestamp, salt) so that a replica
/// re-deriving the same triple gets the same id, which is what makes
/// dedup-by-id idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn derive(replica: &ReplicaId, logical: u64, salt: u64) -> Self {
        let name = format!("{replica}:{logical}:{salt:016x}");
        Self(Uuid::new_v5(&OPERATION_NAMESPACE, name.as_bytes()))
    }

    /// 64 random bits for [`derive`](Self::derive).
    pub fn random_salt() -> u64 {
        Uuid::new_v4().as_u64_pair().0
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an operation does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Delete,
    Update,
    CursorMove,
}

impl OpKind {
    /// Insert and Update must carry a value; Delete must not.
    fn value_rule(self) -> ValueRule {
        match self {
            OpKind::Insert | OpKind::Update => ValueRule::Required,
            OpKind::Delete => ValueRule::Forbidden,
            OpKind::CursorMove => ValueRule::Optional,
        }
    }
}

enum ValueRule {
    Required,
    Forbidden,
    Optional,
}

/// Cell payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Integer(n)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Float(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

/// The caller-supplied part of an operation; the log stamps the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDraft {
    pub kind: OpKind,
    pub target: String,
    pub position: u32,
    pub value: Option<CellValue>,
}

impl OpDraft {
    pub fn insert(target: impl Into<String>, position: u32, value: impl Into<CellValue>) -> Self {
        Self {
            kind: OpKind::Insert,
            target: target.into(),
            position,
            value: Some(value.into()),
        }
    }

    pub fn update(target: impl Into<String>, value: impl Into<CellValue>) -> Self {
        Self {
            kind: OpKind::Update,
            target: target.into(),
            position: 0,
            value: Some(value.into()),
        }
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            target: target.into(),
            position: 0,
            value: None,
        }
    }

    pub fn cursor_move(target: impl Into<String>, position: u32) -> Self {
        Self {
            kind: OpKind::CursorMove,
            target: target.into(),
            position,
            value: None,
        }
    }
}

/// A fully stamped edit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OpKind,
    /// Opaque cell/field key.
    pub target: String,
    /// Offset within the target for sub-cell structure.
    pub position: u32,
    /// `None` for Delete.
    pub value: Option<CellValue>,
    pub replica_id: ReplicaId,
    /// Originating replica's wall clock, ms since epoch. Tiebreak only.
    pub wall_clock: u64,
    /// Origin's clock after incrementing its own counter for this op.
    pub vector_clock: VectorClock,
    /// Up to [`MAX_DEPENDENCIES`] earlier ops on the same target, oldest first.
    pub dependencies: Vec<OperationId>,
}

impl Operation {
    /// Logical timestamp of this operation on its origin replica.
    pub fn logical_time(&self) -> u64 {
        self.vector_clock.get(&self.replica_id)
    }

    /// Check required fields before an operation is allowed into a log.
    pub fn validate(&self) -> Result<(), OperationError> {
        if self.replica_id.is_empty() {
            return Err(OperationError::MissingField { id: self.id, field: "replica_id" });
        }
        if self.target.is_empty() {
            return Err(OperationError::MissingField { id: self.id, field: "target" });
        }
        if self.logical_time() == 0 {
            return Err(OperationError::MissingOriginClock {
                id: self.id,
                replica: self.replica_id.clone(),
            });
        }
        if let Some(replica) = self.vector_clock.saturated_entry() {
            return Err(OperationError::ClockOverflow { replica: replica.clone() });
        }
        if self.dependencies.len() > MAX_DEPENDENCIES {
            return Err(OperationError::TooManyDependencies {
                id: self.id,
                count: self.dependencies.len(),
                max: MAX_DEPENDENCIES,
            });
        }
        match (self.kind.value_rule(), &self.value) {
            (ValueRule::Required, None) => {
                Err(OperationError::MissingField { id: self.id, field: "value" })
            }
            (ValueRule::Forbidden, Some(_)) => Err(OperationError::UnexpectedValue { id: self.id }),
            _ => Ok(()),
        }
    }
}

/// Reasons an operation is refused by the log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("operation {id} is missing required field `{field}`")]
    MissingField { id: OperationId, field: &'static str },
    #[error("operation {id} is a delete but carries a value")]
    UnexpectedValue { id: OperationId },
    #[error("operation {id} has no clock entry for its origin replica {replica}")]
    MissingOriginClock { id: OperationId, replica: ReplicaId },
    #[error("clock counter for {replica} is exhausted")]
    ClockOverflow { replica: ReplicaId },
    #[error("operation {id} lists {count} dependencies (max {max})")]
    TooManyDependencies { id: OperationId, count: usize, max: usize },
}
