use std::collections::HashMap;

use tracing::debug;

use crate::types::{RoomRecord, SourceFlags};

/// Merge gateway-reported and protocol-reported rooms into one list.
///
/// Rooms are keyed by `room_id`. Output order is first observation in the
/// gateway list, then protocol-only rooms in protocol order. A room seen in
/// both sources unions its flags, takes display name and member count from
/// the protocol record, and keeps the gateway topic when the protocol has none.
/// No input room is ever dropped.
pub fn merge_rooms(gateway: &[RoomRecord], protocol: &[RoomRecord]) -> Vec<RoomRecord> {
    let mut merged: Vec<RoomRecord> = Vec::with_capacity(gateway.len() + protocol.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for room in gateway {
        match index.get(&room.room_id) {
            Some(&pos) => {
                let existing = &mut merged[pos];
                existing.source = existing.source.union(room.source);
            }
            None => {
                index.insert(room.room_id.clone(), merged.len());
                merged.push(room.clone());
            }
        }
    }

    for room in protocol {
        match index.get(&room.room_id) {
            Some(&pos) => overlay_protocol_fields(&mut merged[pos], room),
            None => {
                index.insert(room.room_id.clone(), merged.len());
                merged.push(room.clone());
            }
        }
    }

    merged
}

fn overlay_protocol_fields(existing: &mut RoomRecord, protocol: &RoomRecord) {
    existing.source = existing.source.union(protocol.source);
    // Unnamed protocol rooms report their ID as the name.
    if protocol.has_meaningful_name() || !existing.has_meaningful_name() {
        existing.display_name = protocol.display_name.clone();
    }
    existing.member_count = protocol.member_count;
    if protocol.topic.is_some() {
        existing.topic = protocol.topic.clone();
    }
}

/// Last known per-source room lists and their merged projection.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    gateway: Vec<RoomRecord>,
    protocol: Vec<RoomRecord>,
    merged: Vec<RoomRecord>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current merged room list.
    pub fn rooms(&self) -> &[RoomRecord] {
        &self.merged
    }

    pub fn get(&self, room_id: &str) -> Option<&RoomRecord> {
        self.merged.iter().find(|room| room.room_id == room_id)
    }

    /// Fold a fresh gateway listing into the gateway snapshot and replace the
    /// protocol snapshot.
    ///
    /// Gateway rooms missing from the listing are kept: a room confirmed by a
    /// create or join stays listed until the session ends.
    pub fn apply_listing(
        &mut self,
        gateway: Vec<RoomRecord>,
        protocol: Vec<RoomRecord>,
    ) -> &[RoomRecord] {
        for room in gateway {
            upsert(&mut self.gateway, room);
        }
        self.protocol = protocol;
        self.remerge()
    }

    /// Replace only the protocol snapshot, keeping the last gateway listing.
    pub fn replace_protocol(&mut self, protocol: Vec<RoomRecord>) -> &[RoomRecord] {
        self.protocol = protocol;
        self.remerge()
    }

    /// Record a room confirmed by the gateway (create/join).
    pub fn observe_gateway(&mut self, room: RoomRecord) -> &[RoomRecord] {
        upsert(&mut self.gateway, room);
        self.remerge()
    }

    /// Record a room joined at the protocol level.
    pub fn observe_protocol(&mut self, room: RoomRecord) -> &[RoomRecord] {
        upsert(&mut self.protocol, room);
        self.remerge()
    }

    /// Forget protocol membership for a room (leave). Gateway records stay.
    pub fn forget_protocol(&mut self, room_id: &str) -> &[RoomRecord] {
        self.protocol.retain(|room| room.room_id != room_id);
        self.remerge()
    }

    /// Drop everything; used when the session ends.
    pub fn clear(&mut self) {
        self.gateway.clear();
        self.protocol.clear();
        self.merged.clear();
    }

    fn remerge(&mut self) -> &[RoomRecord] {
        self.merged = merge_rooms(&self.gateway, &self.protocol);
        debug!(
            gateway = self.gateway.len(),
            protocol = self.protocol.len(),
            merged = self.merged.len(),
            "room list merged"
        );
        &self.merged
    }
}

fn upsert(list: &mut Vec<RoomRecord>, room: RoomRecord) {
    match list.iter_mut().find(|existing| existing.room_id == room.room_id) {
        Some(existing) => {
            let source = existing.source.union(room.source);
            *existing = RoomRecord { source, ..room };
        }
        None => list.push(room),
    }
}

/// Minimal record for a room known only by ID.
pub fn placeholder_room(room_id: impl Into<String>, source: SourceFlags) -> RoomRecord {
    let room_id = room_id.into();
    RoomRecord {
        display_name: room_id.clone(),
        room_id,
        topic: None,
        member_count: 0,
        source,
    }
}
