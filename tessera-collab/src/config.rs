//! Session tunables.

/// Configuration for a [`SessionCoordinator`](crate::session::SessionCoordinator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabConfig {
    /// Prefix for session ids and transport topics (`"{prefix}:{resource}"`).
    pub topic_prefix: String,
    /// Buffered application events per observer before the oldest are lost.
    pub event_capacity: usize,
    /// Chat messages kept in memory per session.
    pub chat_history_limit: usize,
    /// Remote cursors silent for longer than this are pruned.
    pub presence_idle_timeout_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "collab".to_string(),
            event_capacity: 256,
            chat_history_limit: 500,
            presence_idle_timeout_ms: 30_000,
        }
    }
}
