use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::{
    error::BackendError,
    types::{LiveEvent, MessageKind, RoomRecord, Session, TimelineEvent},
};

/// Chat-protocol capability bound to one transport address for its lifetime.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Base URL this handle was built against.
    fn base_url(&self) -> &str;

    /// Establish the live sync stream and keep it running in the background.
    async fn start_sync(&self) -> Result<(), BackendError>;

    /// Stop the live sync stream.
    async fn stop_sync(&self) -> Result<(), BackendError>;

    /// Subscribe to the process-wide live event stream (all joined rooms).
    fn subscribe_live(&self) -> broadcast::Receiver<LiveEvent>;

    /// Subscribe to one room's live events with a queue of its own.
    ///
    /// Nothing is dropped while the receiver is held.
    fn subscribe_room(&self, room_id: &str) -> mpsc::UnboundedReceiver<TimelineEvent>;

    /// Fetch the most recent `limit` events of a room, newest first.
    async fn fetch_timeline(
        &self,
        room_id: &str,
        limit: u16,
    ) -> Result<Vec<TimelineEvent>, BackendError>;

    /// Send a message and return its event ID.
    async fn send_message(
        &self,
        room_id: &str,
        body: &str,
        kind: MessageKind,
    ) -> Result<String, BackendError>;

    /// Join a room by ID or alias and return the room ID.
    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, BackendError>;

    async fn leave_room(&self, room_id: &str) -> Result<(), BackendError>;

    /// Rooms joined at the protocol level.
    fn joined_rooms(&self) -> Vec<RoomRecord>;

    /// Invalidate the access token at the server.
    async fn logout(&self) -> Result<(), BackendError>;
}

/// Builds protocol handles for a session at a chosen transport address.
#[async_trait]
pub trait ProtocolClientFactory: Send + Sync {
    /// Construct a handle addressed at `base_url` using `session`'s credentials.
    ///
    /// No re-authentication happens; the gateway-issued token is reused.
    async fn connect(
        &self,
        base_url: &str,
        session: &Session,
    ) -> Result<Arc<dyn ProtocolClient>, BackendError>;
}
