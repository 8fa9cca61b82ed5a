//! Fire-and-forget chat and cell annotations.
//!
//! No ordering, no conflict resolution: each replica shows messages in
//! the order they arrived there. History lives only as long as the session.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use crate::clock::{wall_clock_ms, ReplicaId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    /// Session-wide chat line.
    Message,
    /// Note attached to a cell.
    Annotation,
    /// Generated by the application (joins, leaves, notices).
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub replica_id: ReplicaId,
    pub display_name: String,
    pub text: String,
    /// Cell this message is scoped to, if any.
    pub target: Option<String>,
    pub wall_clock: u64,
    pub kind: ChatKind,
}

/// Insertion-ordered chat history for one session.
///
/// Capped at `history_limit` messages; the oldest are evicted first.
#[derive(Debug)]
pub struct ChatRelay {
    replica_id: ReplicaId,
    display_name: String,
    history: VecDeque<ChatMessage>,
    /// Ids currently in `history`, for best-effort at-most-once display.
    seen: HashSet<Uuid>,
    history_limit: usize,
}

impl ChatRelay {
    pub fn new(
        replica_id: ReplicaId,
        display_name: impl Into<String>,
        history_limit: usize,
    ) -> Self {
        Self {
            replica_id,
            display_name: display_name.into(),
            history: VecDeque::with_capacity(history_limit.min(256)),
            seen: HashSet::new(),
            history_limit,
        }
    }

    /// Stamp a local message and add it to the history.
    pub fn send(
        &mut self,
        text: impl Into<String>,
        target: Option<String>,
        kind: ChatKind,
    ) -> ChatMessage {
        let msg = ChatMessage {
            id: Uuid::new_v4(),
            replica_id: self.replica_id.clone(),
            display_name: self.display_name.clone(),
            text: text.into(),
            target,
            wall_clock: wall_clock_ms(),
            kind,
        };
        self.push(msg.clone());
        msg
    }

    /// Append a message from another replica.
    ///
    /// Returns `false` if the same id is still in the history window.
    pub fn observe_remote(&mut self, msg: ChatMessage) -> bool {
        if self.seen.contains(&msg.id) {
            return false;
        }
        self.push(msg);
        true
    }

    fn push(&mut self, msg: ChatMessage) {
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            if let Some(evicted) = self.history.pop_front() {
                self.seen.remove(&evicted.id);
            }
        }
        self.seen.insert(msg.id);
        self.history.push_back(msg);
    }

    /// History in arrival order.
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }

    /// Annotations attached to `target`, arrival order.
    pub fn annotations_for<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = &'a ChatMessage> + 'a {
        self.history
            .iter()
            .filter(move |m| m.target.as_deref() == Some(target))
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.seen.clear();
    }
}
