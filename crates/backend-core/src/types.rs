use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Matrix event type carried by room messages.
pub const ROOM_MESSAGE_EVENT_TYPE: &str = "m.room.message";

/// Transport path used by a protocol-client handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Direct connection to the origin chat server.
    Standard,
    /// Connection routed through the overlay-aware bridge endpoint.
    Enhanced,
}

impl ConnectionMode {
    /// Mode implied by an overlay status: enhanced iff the daemon was detected.
    pub fn for_status(status: &OverlayStatus) -> Self {
        if status.detected {
            Self::Enhanced
        } else {
            Self::Standard
        }
    }

    /// Stable lowercase label used in logs and status lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Enhanced => "enhanced",
        }
    }
}

/// Authenticated account state owned by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Fully qualified Matrix user ID issued by the gateway.
    pub user_id: String,
    /// Gateway-issued access token.
    pub access_token: String,
    /// Device ID bound to the access token.
    pub device_id: String,
    /// Origin chat server name the user logged in against.
    pub server_name: String,
    /// Transport mode chosen when the session's handle was built.
    ///
    /// Informational only once persisted; restore recomputes it.
    pub connection_mode: ConnectionMode,
}

/// Snapshot of the overlay daemon produced by a single poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OverlayStatus {
    /// The daemon's admin endpoint answered with a 2xx status.
    pub detected: bool,
    /// The daemon is reachable and usable for routing.
    pub connected: bool,
    /// Daemon version when reported.
    pub version: Option<String>,
    /// Number of peers known to the daemon.
    pub peer_count: u32,
    /// Status code or transport failure from the last poll.
    pub error: Option<String>,
}

impl OverlayStatus {
    /// Status for a reachable daemon.
    pub fn detected(version: Option<String>, peer_count: u32) -> Self {
        Self {
            detected: true,
            connected: true,
            version,
            peer_count,
            error: None,
        }
    }

    /// Status for an absent or failing daemon.
    pub fn undetected(error: impl Into<String>) -> Self {
        Self {
            detected: false,
            connected: false,
            version: None,
            peer_count: 0,
            error: Some(error.into()),
        }
    }

    /// Health projection of this status.
    pub fn health(&self) -> NetworkHealth {
        NetworkHealth::classify(self.detected, self.peer_count)
    }
}

/// Overlay network health, ordered from worst to best.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkHealth {
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl NetworkHealth {
    /// Classify health from detection state and peer count.
    pub fn classify(detected: bool, peer_count: u32) -> Self {
        if !detected {
            return Self::Offline;
        }
        match peer_count {
            5..=u32::MAX => Self::Excellent,
            3..=4 => Self::Good,
            1..=2 => Self::Fair,
            0 => Self::Poor,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }
}

/// Which backends reported a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SourceFlags {
    /// Known to the gateway database.
    pub from_gateway: bool,
    /// Joined at the protocol level.
    pub from_protocol: bool,
}

impl SourceFlags {
    pub const GATEWAY: Self = Self {
        from_gateway: true,
        from_protocol: false,
    };

    pub const PROTOCOL: Self = Self {
        from_gateway: false,
        from_protocol: true,
    };

    pub fn union(self, other: Self) -> Self {
        Self {
            from_gateway: self.from_gateway || other.from_gateway,
            from_protocol: self.from_protocol || other.from_protocol,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.from_gateway && !self.from_protocol
    }
}

/// One room in the merged room list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomRecord {
    /// Matrix room ID; the record's identity.
    pub room_id: String,
    /// Best-effort display name.
    pub display_name: String,
    /// Room topic when known.
    pub topic: Option<String>,
    /// Joined member count.
    pub member_count: u64,
    /// Reporting backends.
    pub source: SourceFlags,
}

impl RoomRecord {
    /// Whether the display name carries information beyond the room ID.
    pub fn has_meaningful_name(&self) -> bool {
        let name = self.display_name.trim();
        !name.is_empty() && name != self.room_id
    }
}

/// Message kind derived from the Matrix `msgtype`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    /// `m.text`
    Text,
    /// `m.notice`
    Notice,
    /// `m.emote`
    Emote,
    /// Any other `msgtype` (images, files, custom types).
    Other(String),
}

impl MessageKind {
    /// Map a `msgtype` string; missing values default to text.
    pub fn from_msgtype(msgtype: Option<&str>) -> Self {
        match msgtype {
            None | Some("m.text") => Self::Text,
            Some("m.notice") => Self::Notice,
            Some("m.emote") => Self::Emote,
            Some(other) => Self::Other(other.to_owned()),
        }
    }

    pub fn as_msgtype(&self) -> &str {
        match self {
            Self::Text => "m.text",
            Self::Notice => "m.notice",
            Self::Emote => "m.emote",
            Self::Other(value) => value,
        }
    }
}

/// Immutable timeline message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    /// Event ID, unique per room.
    pub id: String,
    /// Sender user ID.
    pub sender: String,
    /// Display-ready body.
    pub body: String,
    /// Origin server timestamp in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    /// Message kind.
    pub kind: MessageKind,
}

impl MessageRecord {
    /// Compare by timestamp, breaking ties on event ID.
    pub fn ordering_cmp(&self, other: &Self) -> Ordering {
        self.timestamp_ms
            .cmp(&other.timestamp_ms)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Raw timeline event as surfaced by the protocol client, before filtering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEvent {
    /// Event ID when the server assigned one.
    pub event_id: Option<String>,
    /// Matrix event type, for example `m.room.message`.
    pub event_type: String,
    /// Sender user ID.
    pub sender: String,
    /// `content.body` when present.
    pub body: Option<String>,
    /// `content.msgtype` when present.
    pub msgtype: Option<String>,
    /// Origin server timestamp in milliseconds.
    pub timestamp_ms: u64,
}

impl TimelineEvent {
    /// Convert into a message record; `None` for non-message or ID-less events.
    pub fn to_message(&self) -> Option<MessageRecord> {
        if self.event_type != ROOM_MESSAGE_EVENT_TYPE {
            return None;
        }
        let id = self.event_id.clone()?;
        Some(MessageRecord {
            id,
            sender: self.sender.clone(),
            body: self.body.clone().unwrap_or_default(),
            timestamp_ms: self.timestamp_ms,
            kind: MessageKind::from_msgtype(self.msgtype.as_deref()),
        })
    }
}

/// Event delivered on the protocol client's process-wide live stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveEvent {
    /// Room the event belongs to.
    pub room_id: String,
    /// The event itself.
    pub event: TimelineEvent,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    /// No session; login or restore may start.
    Anonymous,
    /// A login or restore flow is running.
    Authenticating,
    /// A session and protocol handle exist.
    Authenticated,
}

/// Live sync status for the current protocol handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether the live sync loop is running.
    pub running: bool,
    /// Live delivery is unavailable until the handle is recreated.
    pub degraded: bool,
    /// Optional hint about the next retry delay.
    pub lag_hint_ms: Option<u64>,
}

/// Events emitted by the session core for presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session lifecycle transition.
    StateChanged {
        /// New lifecycle state.
        state: SessionState,
    },
    /// Result of a login or restore flow.
    AuthResult {
        /// `true` when the flow produced an authenticated session.
        success: bool,
        /// Stable error code when `success == false`.
        error_code: Option<String>,
    },
    /// Connection mode chosen for a new protocol handle.
    ModeSelected {
        mode: ConnectionMode,
        base_url: String,
    },
    /// Live sync status update.
    SyncStatus(SyncStatus),
    /// Full merged room list replacement.
    RoomListUpdated { rooms: Vec<RoomRecord> },
    /// Non-fatal problem attached to an otherwise successful operation.
    Warning { code: String, message: String },
}

impl SessionEvent {
    /// Build a warning event from an error payload.
    pub fn warning(error: &BackendError) -> Self {
        Self::Warning {
            code: error.code.clone(),
            message: error.message.clone(),
        }
    }
}
