use std::{sync::Arc, time::Duration};

use backend_core::{
    BackendError, BackendErrorCategory, Outcome, ProtocolClient, RoomRecord, RoomRegistry,
    SessionEvent, SourceFlags, normalize_secondary_outcome, placeholder_room, soften_conflict,
};
use backend_gateway::{CreateRoomRequest, JoinedRoom};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{SessionManager, bounded};

/// Dual-backend room membership: the gateway is authoritative, the protocol
/// handle is attached best-effort.
pub struct RoomService {
    manager: Arc<SessionManager>,
    registry: Mutex<RoomRegistry>,
    protocol_timeout: Duration,
}

impl RoomService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let protocol_timeout = manager.config().protocol_timeout;
        Self {
            manager,
            registry: Mutex::new(RoomRegistry::new()),
            protocol_timeout,
        }
    }

    pub async fn rooms(&self) -> Vec<RoomRecord> {
        self.registry.lock().await.rooms().to_vec()
    }

    /// Rebuild the list from a fresh gateway listing and the handle's joined rooms.
    pub async fn refresh(&self) -> Result<Vec<RoomRecord>, BackendError> {
        let (session, protocol) = self.manager.authenticated("list rooms").await?;
        let gateway: Vec<RoomRecord> = self
            .manager
            .gateway()
            .list_rooms(Some(&session.access_token))
            .await?
            .into_iter()
            .map(RoomRecord::from)
            .collect();
        let joined = protocol.joined_rooms();
        debug!(
            gateway = gateway.len(),
            protocol = joined.len(),
            "refreshing room list"
        );

        let rooms = self.registry.lock().await.apply_listing(gateway, joined).to_vec();
        self.publish(&rooms);
        Ok(rooms)
    }

    /// Create at the gateway, then attach the protocol handle to the new room.
    ///
    /// A gateway failure fails the whole operation and skips the protocol step.
    pub async fn create_room(
        &self,
        request: CreateRoomRequest,
    ) -> Result<Outcome<RoomRecord>, BackendError> {
        let (session, protocol) = self.manager.authenticated("create room").await?;
        let created = self
            .manager
            .gateway()
            .create_room(Some(&session.access_token), &request)
            .await?;
        info!(room_id = %created.room_id, "room created at gateway");

        let record = created.to_record(request.topic.clone());
        self.registry.lock().await.observe_gateway(record);

        let attached = bounded(
            "protocol join",
            self.protocol_timeout,
            protocol.join_room(&created.room_id),
        )
        .await;
        self.finish_dual_op("create room", &created.room_id, protocol.as_ref(), attached)
            .await
    }

    /// Join at the gateway, then at the protocol level.
    ///
    /// "Already joined" from either backend counts as success. The record is
    /// keyed by the room id the protocol join resolves, so joining by alias
    /// never leaves a second entry.
    pub async fn join_room(
        &self,
        room_id_or_alias: &str,
    ) -> Result<Outcome<RoomRecord>, BackendError> {
        let (session, protocol) = self.manager.authenticated("join room").await?;
        let joined = soften_conflict(
            self.manager
                .gateway()
                .join_room(Some(&session.access_token), room_id_or_alias)
                .await
                .map_err(BackendError::from),
            |err| {
                debug!(room = room_id_or_alias, code = %err.code, "already joined at gateway");
                JoinedRoom {
                    room_id: room_id_or_alias.to_owned(),
                    joined: true,
                }
            },
        )?;
        if !joined.joined {
            return Err(BackendError::new(
                BackendErrorCategory::Conflict,
                "gateway_join_refused",
                format!("gateway did not join {room_id_or_alias}"),
            ));
        }
        info!(room = %joined.room_id, "room joined at gateway");

        let attached = soften_conflict(
            bounded(
                "protocol join",
                self.protocol_timeout,
                protocol.join_room(&joined.room_id),
            )
            .await,
            |_| joined.room_id.clone(),
        );
        // An alias only resolves to the room id once the protocol join answers.
        let room_id = match &attached {
            Ok(resolved) => resolved.clone(),
            Err(_) => joined.room_id,
        };

        {
            let mut registry = self.registry.lock().await;
            let record = match registry.get(&room_id) {
                Some(known) => RoomRecord {
                    source: SourceFlags::GATEWAY,
                    ..known.clone()
                },
                None => placeholder_room(&room_id, SourceFlags::GATEWAY),
            };
            registry.observe_gateway(record);
        }

        self.finish_dual_op("join room", &room_id, protocol.as_ref(), attached)
            .await
    }

    /// Leave at the protocol level; a gateway-known record stays listed.
    pub async fn leave_room(&self, room_id: &str) -> Result<Vec<RoomRecord>, BackendError> {
        let (_, protocol) = self.manager.authenticated("leave room").await?;
        bounded(
            "protocol leave",
            self.protocol_timeout,
            protocol.leave_room(room_id),
        )
        .await?;
        info!(room_id, "left room");

        let rooms = self.registry.lock().await.forget_protocol(room_id).to_vec();
        self.publish(&rooms);
        Ok(rooms)
    }

    /// Forget every room; used after logout.
    pub async fn clear(&self) {
        self.registry.lock().await.clear();
        self.publish(&[]);
    }

    async fn finish_dual_op(
        &self,
        operation: &str,
        room_id: &str,
        protocol: &dyn ProtocolClient,
        attached: Result<String, BackendError>,
    ) -> Result<Outcome<RoomRecord>, BackendError> {
        let (outcome, attached) = normalize_secondary_outcome(operation, room_id, attached);

        let (record, rooms) = {
            let mut registry = self.registry.lock().await;
            if attached.is_some() {
                registry.replace_protocol(protocol.joined_rooms());
                // The handle may not list the room until its next sync.
                if let Some(known) = registry.get(room_id)
                    && !known.source.from_protocol
                {
                    let observed = RoomRecord {
                        source: SourceFlags::PROTOCOL,
                        ..known.clone()
                    };
                    registry.observe_protocol(observed);
                }
            }
            let record = registry
                .get(room_id)
                .cloned()
                .unwrap_or_else(|| placeholder_room(room_id, SourceFlags::GATEWAY));
            (record, registry.rooms().to_vec())
        };

        if let Some(warning) = &outcome.warning {
            warn!(room_id, code = %warning.code, "room usable via gateway only");
            self.manager.events().emit(SessionEvent::warning(warning));
        }
        self.publish(&rooms);
        Ok(outcome.map(|_| record))
    }

    fn publish(&self, rooms: &[RoomRecord]) {
        self.manager.events().emit(SessionEvent::RoomListUpdated {
            rooms: rooms.to_vec(),
        });
    }
}
