//! Ephemeral cursor and presence tracking.
//!
//! Provides multiplayer "who is looking at which cell". Nothing here is
//! logged or ordered: each replica's newest cursor simply overwrites the
//! previous one.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceTracker::update_local()  ──► CursorPosition ──► transport
//!                                                            │
//!                                                            ▼
//!                                          remote PresenceTracker::observe_remote()
//!                                                            │
//!                                                            ▼
//!                                                  list_others() → UI
//! ```
//!
//! Transport presence sync (`PresenceMeta` lists) only seeds placeholder
//! entries; it is never needed for correctness.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::clock::{wall_clock_ms, ReplicaId};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Fixed cursor palette. Chosen for contrast on a white grid.
pub const CURSOR_PALETTE: [&str; 12] = [
    "#E53935", "#8E24AA", "#3949AB", "#039BE5", "#00897B", "#7CB342",
    "#FDD835", "#FB8C00", "#6D4C41", "#D81B60", "#5E35B1", "#00ACC1",
];

/// Stable palette color for a replica.
///
/// FNV-1a over the id bytes so the same user gets the same color in every
/// session and on every replica, independent of process hash seeds.
pub fn cursor_color(replica: &ReplicaId) -> &'static str {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in replica.as_str().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    CURSOR_PALETTE[(hash % CURSOR_PALETTE.len() as u64) as usize]
}

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// Latest cursor of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub replica_id: ReplicaId,
    /// Cell the cursor is in; empty for a placeholder from presence sync.
    pub target: String,
    pub position: u32,
    pub color: String,
    pub display_name: String,
    /// Sender's wall clock, ms since epoch.
    pub wall_clock: u64,
}

/// Identity metadata announced through transport presence tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub replica_id: ReplicaId,
    pub display_name: String,
    pub color: String,
    pub joined_at: u64,
}

impl PresenceMeta {
    pub fn new(replica_id: ReplicaId, display_name: impl Into<String>) -> Self {
        let color = cursor_color(&replica_id).to_string();
        Self {
            replica_id,
            display_name: display_name.into(),
            color,
            joined_at: wall_clock_ms(),
        }
    }

    fn placeholder_cursor(&self) -> CursorPosition {
        CursorPosition {
            replica_id: self.replica_id.clone(),
            target: String::new(),
            position: 0,
            color: self.color.clone(),
            display_name: self.display_name.clone(),
            wall_clock: self.joined_at,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Cursor state for every replica in one session.
#[derive(Debug)]
pub struct PresenceTracker {
    local: PresenceMeta,
    /// Includes the local cursor once `update_local` has been called.
    cursors: HashMap<ReplicaId, CursorPosition>,
}

impl PresenceTracker {
    pub fn new(replica_id: ReplicaId, display_name: impl Into<String>) -> Self {
        Self {
            local: PresenceMeta::new(replica_id, display_name),
            cursors: HashMap::new(),
        }
    }

    /// Build and store the local cursor.
    pub fn update_local(&mut self, target: impl Into<String>, position: u32) -> CursorPosition {
        self.update_local_at(target, position, wall_clock_ms())
    }

    pub fn update_local_at(
        &mut self,
        target: impl Into<String>,
        position: u32,
        wall_clock: u64,
    ) -> CursorPosition {
        let cursor = CursorPosition {
            replica_id: self.local.replica_id.clone(),
            target: target.into(),
            position,
            color: self.local.color.clone(),
            display_name: self.local.display_name.clone(),
            wall_clock,
        };
        self.cursors.insert(cursor.replica_id.clone(), cursor.clone());
        cursor
    }

    /// Overwrite the stored cursor for the sender. Returns `false` for our
    /// own cursor echoed back by the transport.
    pub fn observe_remote(&mut self, cursor: CursorPosition) -> bool {
        if cursor.replica_id == self.local.replica_id {
            return false;
        }
        log::trace!("Cursor {} → {}:{}", cursor.replica_id, cursor.target, cursor.position);
        self.cursors.insert(cursor.replica_id.clone(), cursor);
        true
    }

    /// Reconcile with the transport's member list.
    ///
    /// Members without a cursor get a placeholder; cursors of replicas that
    /// are no longer members are dropped.
    pub fn seed(&mut self, members: &[PresenceMeta]) {
        for member in members {
            if member.replica_id == self.local.replica_id {
                continue;
            }
            self.cursors
                .entry(member.replica_id.clone())
                .or_insert_with(|| member.placeholder_cursor());
        }
        let local = self.local.replica_id.clone();
        self.cursors.retain(|replica, _| {
            *replica == local || members.iter().any(|m| &m.replica_id == replica)
        });
    }

    /// Forget a replica after an explicit leave.
    pub fn remove(&mut self, replica: &ReplicaId) -> Option<CursorPosition> {
        self.cursors.remove(replica)
    }

    /// Drop remote cursors not refreshed within `timeout_ms` of `now`.
    pub fn prune_idle(&mut self, now: u64, timeout_ms: u64) -> Vec<ReplicaId> {
        let local = &self.local.replica_id;
        let stale: Vec<ReplicaId> = self
            .cursors
            .values()
            .filter(|c| &c.replica_id != local && now.saturating_sub(c.wall_clock) > timeout_ms)
            .map(|c| c.replica_id.clone())
            .collect();
        for replica in &stale {
            self.cursors.remove(replica);
        }
        stale
    }

    /// Every cursor except the local one, ordered by replica id.
    pub fn list_others(&self) -> Vec<CursorPosition> {
        let mut others: Vec<CursorPosition> = self
            .cursors
            .values()
            .filter(|c| c.replica_id != self.local.replica_id)
            .cloned()
            .collect();
        others.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
        others
    }

    pub fn cursor(&self, replica: &ReplicaId) -> Option<&CursorPosition> {
        self.cursors.get(replica)
    }

    /// Metadata to announce through `track_presence`.
    pub fn local_meta(&self) -> &PresenceMeta {
        &self.local
    }

    pub fn local_color(&self) -> &str {
        &self.local.color
    }

    pub fn peer_count(&self) -> usize {
        self.cursors
            .keys()
            .filter(|r| **r != self.local.replica_id)
            .count()
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }
}
