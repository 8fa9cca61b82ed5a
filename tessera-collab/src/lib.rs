//! # tessera-collab — Real-time collaborative editing engine
//!
//! Concurrent edits to shared documents (spreadsheet cells, text), live
//! cursors and chat, kept consistent across replicas with vector clocks and
//! deterministic last-writer-wins resolution.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐   Envelope bytes   ┌────────────────────┐
//! │ SessionCoordinator │ ◄────────────────► │ SessionCoordinator │
//! │ (replica A)        │     Transport      │ (replica B)        │
//! └─────────┬──────────┘  LocalHub | Relay  └─────────┬──────────┘
//!           │                                         │
//!           ▼                                         ▼
//! ┌────────────────────┐                    ┌────────────────────┐
//! │ OperationLog       │                    │ OperationLog       │
//! │ PresenceTracker    │                    │ PresenceTracker    │
//! │ ChatRelay          │                    │ ChatRelay          │
//! └─────────┬──────────┘                    └─────────┬──────────┘
//!           ▼                                         ▼
//!        resolver ═══════ same winners on both ═══════ resolver
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — Vector clocks and the per-replica clock store
//! - [`operation`] — Operation types, ids and validation
//! - [`oplog`] — Deduplicating append-only operation log
//! - [`resolver`] — Per-target last-writer-wins resolution
//! - [`presence`] — Live cursors and member tracking
//! - [`chat`] — Chat lines and cell annotations
//! - [`protocol`] — Binary envelope (bincode)
//! - [`transport`] — Pub/sub boundary and the in-process hub
//! - [`session`] — Session lifecycle and wiring
//! - [`relay`] — WebSocket relay server
//! - [`ws`] — WebSocket client transport

pub mod chat;
pub mod clock;
pub mod config;
pub mod operation;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod ws;

// Re-exports for convenience
pub use chat::{ChatKind, ChatMessage, ChatRelay};
pub use clock::{dominates, Causality, ClockStore, ReplicaId, VectorClock};
pub use config::CollabConfig;
pub use operation::{
    CellValue, OpDraft, OpKind, Operation, OperationError, OperationId, MAX_DEPENDENCIES,
};
pub use oplog::OperationLog;
pub use presence::{cursor_color, CursorPosition, PresenceMeta, PresenceTracker};
pub use protocol::{Envelope, EnvelopeKind, ProtocolError};
pub use relay::{RelayConfig, RelayError, RelayFrame, RelayServer, RelayStats};
pub use resolver::{conflicts, resolve, resolve_target, resolve_with_shadows, Resolution};
pub use session::{Session, SessionCoordinator, SessionError, SessionEvent, SessionId, SessionState};
pub use transport::{
    HubStats, LocalHub, Subscription, SubscriptionId, Transport, TransportError, TransportEvent,
};
pub use ws::WsTransport;
