#![forbid(unsafe_code)]

// Room module - authoritative box occupancy per room
pub mod roles;
pub mod types;

pub use roles::{BoxRole, HOST_BOX};
pub use types::{
    validate_layout, BoxState, Participant, Rejection, RoomState, UserInfo, ALLOWED_BOX_COUNTS,
};

use crate::db::{AuditLog, BoxJoinRecord};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::ServerMessage;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Outbound queue of a subscribed connection (pre-serialized JSON)
pub type Outbound = mpsc::Sender<Arc<String>>;

/// Room state
pub struct Room {
    pub id: String,
    /// Claimed by the first user accepted into box 1
    pub host_user_id: Option<String>,
    /// Index i holds box i + 1
    boxes: Vec<Option<Participant>>,
    subscribers: HashMap<String, Outbound>,
    /// Set while the room has neither subscribers nor occupants
    idle_since: Option<Instant>,
    closed: bool,
}

impl Room {
    fn new(id: String, max_boxes: u8) -> Self {
        Self {
            id,
            host_user_id: None,
            boxes: vec![None; usize::from(max_boxes)],
            subscribers: HashMap::new(),
            idle_since: Some(Instant::now()),
            closed: false,
        }
    }

    pub fn max_boxes(&self) -> u8 {
        self.boxes.len() as u8
    }

    fn slot(&self, box_id: u8) -> Result<usize, Rejection> {
        if box_id == 0 || usize::from(box_id) > self.boxes.len() {
            return Err(Rejection::InvalidBox);
        }
        Ok(usize::from(box_id) - 1)
    }

    /// Box currently held by a connection, if any
    fn box_held_by(&self, connection_id: &str) -> Option<u8> {
        self.boxes
            .iter()
            .position(|b| b.as_ref().is_some_and(|p| p.connection_id == connection_id))
            .map(|i| (i + 1) as u8)
    }

    fn occupied_count(&self) -> usize {
        self.boxes.iter().filter(|b| b.is_some()).count()
    }

    fn snapshot(&self) -> RoomState {
        RoomState {
            room_id: self.id.clone(),
            max_boxes: self.max_boxes(),
            host_user_id: self.host_user_id.clone(),
            boxes: self
                .boxes
                .iter()
                .enumerate()
                .map(|(i, occupant)| {
                    let id = (i + 1) as u8;
                    BoxState {
                        id,
                        role: BoxRole::for_box(id),
                        occupied_by: occupant.clone(),
                    }
                })
                .collect(),
        }
    }

    fn refresh_idle(&mut self) {
        if self.subscribers.is_empty() && self.occupied_count() == 0 {
            self.idle_since.get_or_insert_with(Instant::now);
        } else {
            self.idle_since = None;
        }
    }

    /// Clears a box and tells every subscriber. Caller has checked ownership.
    fn vacate(&mut self, index: usize) -> Option<Participant> {
        let previous = self.boxes[index].take()?;
        self.broadcast_all(&ServerMessage::BoxLeft {
            room_id: self.id.clone(),
            box_id: (index + 1) as u8,
        });
        self.refresh_idle();
        Some(previous)
    }

    fn deliver(&self, connection_id: &str, sender: &Outbound, json: Arc<String>) {
        match sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for connection {} in room {}, dropping message", connection_id, self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for connection {} in room {} (disconnected)", connection_id, self.id);
            }
        }
    }

    /// Broadcast a message to all subscribers except the sender
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, sender) in &self.subscribers {
            if id != sender_id {
                self.deliver(id, sender, json.clone());
            }
        }
    }

    /// Broadcast a message to all subscribers
    fn broadcast_all(&self, message: &ServerMessage) {
        self.broadcast_except("", message);
    }

    /// Send a message to one subscriber
    fn send_to(&self, connection_id: &str, message: &ServerMessage) {
        let Some(sender) = self.subscribers.get(connection_id) else {
            return;
        };
        match serde_json::to_string(message) {
            Ok(json) => self.deliver(connection_id, sender, Arc::new(json)),
            Err(e) => warn!("Failed to serialize message: {}", e),
        }
    }
}

/// Authoritative owner of box occupancy for every room.
///
/// The outer map sits behind a std::sync::RwLock held only for brief
/// lookups and inserts. Each room has its own tokio::sync::RwLock; every
/// occupancy change and the broadcast announcing it happen under that
/// room's write lock, so subscribers see events in mutation order.
pub struct RoomRegistry {
    rooms: Arc<StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>>,
    /// Rooms each connection has subscribed to or joined a box in
    presence: StdRwLock<HashMap<String, HashSet<String>>>,
    default_max_boxes: u8,
    audit: AuditLog,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(default_max_boxes: u8, audit: AuditLog, metrics: ServerMetrics) -> Self {
        let default_max_boxes = validate_layout(default_max_boxes).unwrap_or_else(|_| {
            warn!("Unsupported default box count {}, using 4", default_max_boxes);
            4
        });
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            presence: StdRwLock::new(HashMap::new()),
            default_max_boxes,
            audit,
            metrics,
        }
    }

    fn get_room(&self, room_id: &str) -> Result<Arc<TokioRwLock<Room>>, Rejection> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned().ok_or(Rejection::RoomNotFound)
    }

    fn note_presence(&self, connection_id: &str, room_id: &str) {
        let mut presence = self.presence.write().unwrap_or_else(|e| e.into_inner());
        presence
            .entry(connection_id.to_string())
            .or_default()
            .insert(room_id.to_string());
    }

    fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        let presence = self.presence.read().unwrap_or_else(|e| e.into_inner());
        presence
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Opens a room, creating it if needed. The box count only applies when
    /// the room is created. Returns true if the room was created by this call.
    pub fn open_room(&self, room_id: &str, requested_boxes: Option<u8>) -> Result<bool, Rejection> {
        let max_boxes = match requested_boxes {
            Some(n) => validate_layout(n)?,
            None => self.default_max_boxes,
        };

        // Fast path: room exists (brief outer read lock)
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if rooms.contains_key(room_id) {
                return Ok(false);
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        // Re-check under write lock (handles concurrent creation)
        if rooms.contains_key(room_id) {
            return Ok(false);
        }
        rooms.insert(
            room_id.to_string(),
            Arc::new(TokioRwLock::new(Room::new(room_id.to_string(), max_boxes))),
        );
        self.metrics.inc_rooms_created();
        info!("Created room {} with {} boxes", room_id, max_boxes);
        Ok(true)
    }

    /// Subscribes a connection to a room's events. The current state is
    /// queued to the subscriber under the room lock, so no later event can
    /// overtake it.
    pub async fn subscribe(
        &self,
        room_id: &str,
        connection_id: &str,
        sender: Outbound,
    ) -> Result<RoomState, Rejection> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        if room.closed {
            return Err(Rejection::RoomNotFound);
        }
        room.subscribers.insert(connection_id.to_string(), sender);
        room.refresh_idle();
        self.note_presence(connection_id, room_id);

        let state = room.snapshot();
        room.send_to(connection_id, &ServerMessage::RoomState(state.clone()));
        debug!("Connection {} subscribed to room {}", connection_id, room_id);
        Ok(state)
    }

    pub async fn unsubscribe(&self, room_id: &str, connection_id: &str) {
        let Ok(room_lock) = self.get_room(room_id) else {
            return;
        };
        let mut room = room_lock.write().await;
        if room.subscribers.remove(connection_id).is_some() {
            room.refresh_idle();
            debug!("Connection {} unsubscribed from room {}", connection_id, room_id);
        }
    }

    /// Claims a box for a participant. The first request observed for a
    /// box wins; later ones get `box_taken` until the box is vacated.
    pub async fn join_box(
        &self,
        room_id: &str,
        box_id: u8,
        participant: Participant,
    ) -> Result<(), Rejection> {
        let result = self.try_join_box(room_id, box_id, participant).await;
        if let Err(reason) = result {
            self.metrics.inc_box_rejections();
            debug!("Join of box {} in room {} rejected: {:?}", box_id, room_id, reason);
        }
        result
    }

    async fn try_join_box(
        &self,
        room_id: &str,
        box_id: u8,
        participant: Participant,
    ) -> Result<(), Rejection> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        if room.closed {
            return Err(Rejection::RoomNotFound);
        }

        let index = room.slot(box_id)?;
        if let Some(occupant) = &room.boxes[index] {
            if occupant.connection_id == participant.connection_id {
                return Err(Rejection::AlreadyInRoom);
            }
            return Err(Rejection::BoxTaken);
        }
        if room.box_held_by(&participant.connection_id).is_some() {
            return Err(Rejection::AlreadyInRoom);
        }
        let role = BoxRole::for_box(box_id);
        if !role.admits(&participant.user.id, room.host_user_id.as_deref()) {
            return Err(Rejection::ReservedForHost);
        }
        if box_id == HOST_BOX && room.host_user_id.is_none() {
            info!("User {} is now host of room {}", participant.user.id, room_id);
            room.host_user_id = Some(participant.user.id.clone());
        }

        room.boxes[index] = Some(participant.clone());
        room.refresh_idle();
        self.note_presence(&participant.connection_id, room_id);

        room.broadcast_except(&participant.connection_id, &ServerMessage::BoxJoined {
            room_id: room_id.to_string(),
            box_id,
            user: participant.user.clone(),
            connection_id: participant.connection_id.clone(),
        });

        self.audit.record(BoxJoinRecord {
            room_id: room_id.to_string(),
            box_id,
            user_id: participant.user.id.clone(),
            connection_id: participant.connection_id.clone(),
            joined_at: participant.joined_at,
        });
        self.metrics.inc_box_joins();

        info!(
            "Connection {} ({}) joined box {} as {} in room {}",
            participant.connection_id,
            participant.user.username,
            box_id,
            role.name(),
            room_id
        );
        Ok(())
    }

    /// Releases a box. Leaving an already empty box succeeds and returns
    /// false; leaving someone else's box is `not_occupant`.
    pub async fn leave_box(
        &self,
        room_id: &str,
        box_id: u8,
        connection_id: &str,
    ) -> Result<bool, Rejection> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;

        let index = room.slot(box_id)?;
        match &room.boxes[index] {
            None => return Ok(false),
            Some(occupant) if occupant.connection_id != connection_id => {
                self.metrics.inc_box_rejections();
                return Err(Rejection::NotOccupant);
            }
            Some(_) => {}
        }

        room.vacate(index);
        self.metrics.inc_box_leaves();
        info!("Connection {} left box {} in room {}", connection_id, box_id, room_id);
        Ok(true)
    }

    /// Current authoritative state of a room
    pub async fn snapshot(&self, room_id: &str) -> Result<RoomState, Rejection> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        Ok(room.snapshot())
    }

    /// Vacates every box held by a disconnected connection, in every room,
    /// and drops its subscriptions. Returns the vacated (room, box) pairs.
    pub async fn drop_connection(&self, connection_id: &str) -> Vec<(String, u8)> {
        let room_ids = {
            let mut presence = self.presence.write().unwrap_or_else(|e| e.into_inner());
            presence.remove(connection_id).unwrap_or_default()
        };

        let mut vacated = Vec::new();
        for room_id in room_ids {
            let Ok(room_lock) = self.get_room(&room_id) else {
                continue;
            };
            let mut room = room_lock.write().await;
            room.subscribers.remove(connection_id);
            if let Some(box_id) = room.box_held_by(connection_id) {
                room.vacate(usize::from(box_id) - 1);
                self.metrics.inc_box_leaves();
                info!("Vacated box {} in room {} after disconnect of {}", box_id, room_id, connection_id);
                vacated.push((room_id.clone(), box_id));
            }
            room.refresh_idle();
        }
        vacated
    }

    /// Connections the caller should negotiate with for a box: every other
    /// occupant of the room. Without a room id, the room is the one where
    /// the caller holds `box_id`.
    pub async fn peers_for_box(
        &self,
        room_id: Option<&str>,
        box_id: u8,
        connection_id: &str,
    ) -> Result<Vec<String>, Rejection> {
        let room_lock = match room_id {
            Some(room_id) => self.get_room(room_id)?,
            None => self.find_room_with_box(box_id, connection_id).await?,
        };
        let room = room_lock.read().await;
        room.slot(box_id)?;
        Ok(room
            .boxes
            .iter()
            .flatten()
            .filter(|p| p.connection_id != connection_id)
            .map(|p| p.connection_id.clone())
            .collect())
    }

    async fn find_room_with_box(
        &self,
        box_id: u8,
        connection_id: &str,
    ) -> Result<Arc<TokioRwLock<Room>>, Rejection> {
        for room_id in self.rooms_of(connection_id) {
            let Ok(room_lock) = self.get_room(&room_id) else {
                continue;
            };
            let held = room_lock.read().await.box_held_by(connection_id);
            if held == Some(box_id) {
                return Ok(room_lock);
            }
        }
        Err(Rejection::RoomNotFound)
    }

    /// Ends the stream: only the occupant of the host box may do this.
    /// Every subscriber receives `room-closed` and the room is removed.
    pub async fn end_room(&self, room_id: &str, connection_id: &str) -> Result<(), Rejection> {
        let room_lock = self.get_room(room_id)?;
        {
            let mut room = room_lock.write().await;
            let can_end = room
                .box_held_by(connection_id)
                .is_some_and(|box_id| BoxRole::for_box(box_id).can_end_stream());
            if !can_end {
                return Err(Rejection::NotHost);
            }
            Self::close_locked(&mut room);
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if rooms.get(room_id).is_some_and(|r| Arc::ptr_eq(r, &room_lock)) {
            rooms.remove(room_id);
        }
        self.metrics.inc_rooms_closed();
        info!("Room {} ended by host connection {}", room_id, connection_id);
        Ok(())
    }

    fn close_locked(room: &mut Room) {
        room.closed = true;
        for slot in room.boxes.iter_mut() {
            slot.take();
        }
        room.broadcast_all(&ServerMessage::RoomClosed { room_id: room.id.clone() });
        room.subscribers.clear();
    }

    /// Removes rooms that have had no subscribers and no occupants for at
    /// least `timeout`. A removed room is marked closed so that callers still
    /// holding it see it as gone. Returns the number of rooms removed.
    pub fn reap_idle(&self, timeout: Duration, now: Instant) -> usize {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let before = rooms.len();
        rooms.retain(|room_id, room_lock| {
            // A room locked by an in-flight operation is not idle
            let Ok(mut room) = room_lock.try_write() else {
                return true;
            };
            let expired = room
                .idle_since
                .is_some_and(|since| now.saturating_duration_since(since) >= timeout);
            if expired {
                room.closed = true;
                info!("Room {} idle for {:?}, removing", room_id, timeout);
            }
            !expired
        });
        let removed = before - rooms.len();
        for _ in 0..removed {
            self.metrics.inc_rooms_closed();
        }
        removed
    }

    /// Closes every room, notifying subscribers.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };
        for (room_id, room_lock) in &all_rooms {
            let mut room = room_lock.write().await;
            Self::close_locked(&mut room);
            debug!("Closed room {}", room_id);
        }
        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Occupied boxes across all rooms (rooms busy with a write are skipped)
    pub fn occupied_box_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .values()
            .filter_map(|lock| lock.try_read().ok().map(|room| room.occupied_count()))
            .sum()
    }
}
