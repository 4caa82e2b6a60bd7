//! Core contract shared by the session, room, and timeline layers.
//!
//! This crate defines the data model, the session lifecycle, timeline and
//! room-list merge helpers, outcome normalization, and the protocol-client
//! capability the rest of the workspace programs against.

/// Broadcast and per-room event fan-out.
pub mod channel;
/// Stable error taxonomy and HTTP classification helpers.
pub mod error;
/// Soft-conflict and degraded-secondary-step normalization.
pub mod normalization;
/// Protocol-client capability traits.
pub mod protocol;
/// Backoff policy used by retry loops.
pub mod retry;
/// Dual-source room list reconciliation.
pub mod rooms;
/// Session lifecycle state machine.
pub mod state_machine;
/// Ordered, deduplicated timeline buffer.
pub mod timeline;
/// Data model shared across crates.
pub mod types;

pub use channel::{EventHub, RoomFeeds};
pub use error::{BackendError, BackendErrorCategory, classify_http_status};
pub use normalization::{Outcome, normalize_secondary_outcome, soften_conflict};
pub use protocol::{ProtocolClient, ProtocolClientFactory};
pub use retry::RetryPolicy;
pub use rooms::{RoomRegistry, merge_rooms, placeholder_room};
pub use state_machine::SessionStateMachine;
pub use timeline::TimelineBuffer;
pub use types::{
    ConnectionMode, LiveEvent, MessageKind, MessageRecord, NetworkHealth, OverlayStatus,
    ROOM_MESSAGE_EVENT_TYPE, RoomRecord, Session, SessionEvent, SessionState, SourceFlags,
    SyncStatus, TimelineEvent,
};
