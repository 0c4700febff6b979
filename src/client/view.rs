#![forbid(unsafe_code)]

// Room view model - box occupancy as last reported by the relay, the media
// each tile shows, and the local participant's pending intents

use super::ClientError;
use crate::room::{BoxRole, Participant, RoomState};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaState {
    None,
    /// Our own capture, shown on the box we occupy
    Local,
    /// Remote stream arriving over the link to this connection
    Attached { remote: String },
    /// Negotiation with the occupant failed or timed out
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    Join { since: Instant },
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxView {
    pub id: u8,
    pub role: BoxRole,
    pub occupant: Option<Participant>,
    pub media: MediaState,
    pub pending: Option<Pending>,
}

impl BoxView {
    fn empty(id: u8) -> Self {
        Self {
            id,
            role: BoxRole::for_box(id),
            occupant: None,
            media: MediaState::None,
            pending: None,
        }
    }

    fn occupant_id(&self) -> Option<&str> {
        self.occupant.as_ref().map(|p| p.connection_id.as_str())
    }
}

/// Snapshot published to the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomView {
    pub room_id: String,
    pub boxes: Vec<BoxView>,
    /// Box held by the local connection, as confirmed by the relay
    pub local_box: Option<u8>,
    pub connected: bool,
    pub closed: bool,
    /// Last intent failure or rejection, for display
    pub notice: Option<String>,
}

impl RoomView {
    pub fn box_view(&self, box_id: u8) -> Option<&BoxView> {
        self.boxes.iter().find(|b| b.id == box_id)
    }
}

/// A box whose occupant changed connection, with the one it replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supersession {
    pub box_id: u8,
    pub previous: Option<String>,
}

pub struct RoomViewModel {
    view: RoomView,
    local_id: Option<String>,
    join_confirm_timeout: Duration,
}

impl RoomViewModel {
    pub fn new(room_id: impl Into<String>, join_confirm_timeout: Duration) -> Self {
        Self {
            view: RoomView {
                room_id: room_id.into(),
                ..Default::default()
            },
            local_id: None,
            join_confirm_timeout,
        }
    }

    pub fn view(&self) -> &RoomView {
        &self.view
    }

    pub fn local_box(&self) -> Option<u8> {
        self.view.local_box
    }

    fn tile_mut(&mut self, box_id: u8) -> Option<&mut BoxView> {
        self.view.boxes.iter_mut().find(|b| b.id == box_id)
    }

    fn is_local(&self, participant: &Participant) -> bool {
        self.local_id.as_deref() == Some(participant.connection_id.as_str())
    }

    fn pending_join(&self) -> Option<u8> {
        self.view
            .boxes
            .iter()
            .find(|b| matches!(b.pending, Some(Pending::Join { .. })))
            .map(|b| b.id)
    }

    pub fn set_connected(&mut self, local_id: impl Into<String>) {
        self.local_id = Some(local_id.into());
        self.view.connected = true;
        self.view.notice = None;
    }

    pub fn set_notice(&mut self, notice: impl Into<String>) {
        self.view.notice = Some(notice.into());
    }

    // --- Intents ---

    /// Joining needs an empty box, no box of our own, and no join in flight
    pub fn can_join(&self, box_id: u8) -> bool {
        !self.view.closed
            && self.view.local_box.is_none()
            && self.pending_join().is_none()
            && self.view.box_view(box_id).is_some_and(|b| b.occupant.is_none())
    }

    pub fn can_leave(&self, box_id: u8) -> bool {
        self.view.local_box == Some(box_id)
    }

    pub fn begin_join(&mut self, box_id: u8, now: Instant) -> Result<(), ClientError> {
        if !self.can_join(box_id) {
            return Err(ClientError::Intent(format!("box {box_id} cannot be joined right now")));
        }
        if let Some(tile) = self.tile_mut(box_id) {
            tile.pending = Some(Pending::Join { since: now });
        }
        Ok(())
    }

    pub fn begin_leave(&mut self, box_id: u8) -> Result<(), ClientError> {
        if !self.can_leave(box_id) {
            return Err(ClientError::Intent(format!("box {box_id} is not ours to leave")));
        }
        if let Some(tile) = self.tile_mut(box_id) {
            tile.pending = Some(Pending::Leave);
        }
        Ok(())
    }

    /// Rolls back optimistic joins that were never confirmed. Returns the
    /// boxes rolled back.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<u8> {
        let timeout = self.join_confirm_timeout;
        let mut expired = Vec::new();
        for tile in &mut self.view.boxes {
            if let Some(Pending::Join { since }) = tile.pending {
                if now.saturating_duration_since(since) >= timeout {
                    tile.pending = None;
                    expired.push(tile.id);
                }
            }
        }
        if !expired.is_empty() {
            info!("Join of box(es) {:?} was not confirmed, rolled back", expired);
            self.view.notice = Some("Join was not confirmed".to_string());
        }
        expired
    }

    // --- Authoritative updates ---

    /// Replaces occupancy with a full snapshot
    pub fn apply_room_state(&mut self, state: &RoomState) -> Vec<Supersession> {
        let old = std::mem::take(&mut self.view.boxes);
        let mut superseded = Vec::new();
        let mut boxes = Vec::with_capacity(state.boxes.len());

        for b in &state.boxes {
            let previous = old.iter().find(|t| t.id == b.id);
            let mut tile = previous.cloned().unwrap_or_else(|| BoxView::empty(b.id));
            let prev_id = previous.and_then(|t| t.occupant_id().map(String::from));
            let new_id = b.occupied_by.as_ref().map(|p| p.connection_id.clone());
            if prev_id != new_id {
                tile.media = MediaState::None;
                if prev_id.is_some() {
                    superseded.push(Supersession { box_id: b.id, previous: prev_id });
                }
            }
            tile.role = b.role;
            tile.occupant = b.occupied_by.clone();
            boxes.push(tile);
        }
        self.view.boxes = boxes;

        self.view.local_box = None;
        let local_id = self.local_id.clone();
        for tile in &mut self.view.boxes {
            let ours = tile.occupant_id().is_some() && tile.occupant_id() == local_id.as_deref();
            if ours {
                tile.media = MediaState::Local;
                self.view.local_box = Some(tile.id);
            }
            // A pending join settles once the box is occupied by anyone
            if tile.occupant.is_some() && matches!(tile.pending, Some(Pending::Join { .. })) {
                tile.pending = None;
            }
            if !ours && tile.pending == Some(Pending::Leave) {
                tile.pending = None;
            }
        }
        debug!("Applied room-state for {} ({} boxes)", state.room_id, state.max_boxes);
        superseded
    }

    /// Someone took a box. Returns the replaced occupant if the box changed hands.
    pub fn apply_box_joined(&mut self, box_id: u8, participant: Participant) -> Option<String> {
        let local = self.is_local(&participant);
        let tile = self.tile_mut(box_id)?;
        let previous = tile.occupant_id().map(String::from);
        let changed = previous.as_deref() != Some(participant.connection_id.as_str());
        if changed {
            tile.media = MediaState::None;
        }
        if matches!(tile.pending, Some(Pending::Join { .. })) && !local {
            debug!("Box {} went to {} before our join settled", box_id, participant.connection_id);
        }
        tile.pending = None;
        tile.occupant = Some(participant);
        if local {
            tile.media = MediaState::Local;
            self.view.local_box = Some(box_id);
        }
        previous.filter(|_| changed)
    }

    /// The relay confirmed our join
    pub fn apply_box_accepted(&mut self, box_id: u8, participant: Participant) {
        self.view.notice = None;
        if let Some(tile) = self.tile_mut(box_id) {
            tile.occupant = Some(participant);
            tile.pending = None;
            tile.media = MediaState::Local;
            self.view.local_box = Some(box_id);
        }
    }

    /// A box emptied. Returns who held it.
    pub fn apply_box_left(&mut self, box_id: u8) -> Option<String> {
        let tile = self.tile_mut(box_id)?;
        let previous = tile.occupant.take().map(|p| p.connection_id);
        tile.media = MediaState::None;
        if tile.pending == Some(Pending::Leave) {
            tile.pending = None;
        }
        if self.view.local_box == Some(box_id) {
            self.view.local_box = None;
        }
        previous
    }

    /// A join-box was refused: drop the optimistic join
    pub fn apply_rejected(&mut self, box_id: Option<u8>, reason: &str) {
        for tile in &mut self.view.boxes {
            let matches_box = box_id.is_none() || box_id == Some(tile.id);
            if matches_box && matches!(tile.pending, Some(Pending::Join { .. })) {
                tile.pending = None;
            }
        }
        self.view.notice = Some(reason.to_string());
    }

    pub fn mark_closed(&mut self) {
        self.view.closed = true;
        self.view.local_box = None;
        for tile in &mut self.view.boxes {
            tile.occupant = None;
            tile.media = MediaState::None;
            tile.pending = None;
        }
    }

    /// Transport lost: forget local occupancy and intents until a fresh
    /// room-state arrives on the next connection.
    pub fn reset(&mut self) {
        self.local_id = None;
        self.view.connected = false;
        self.view.local_box = None;
        for tile in &mut self.view.boxes {
            tile.pending = None;
            tile.media = MediaState::None;
        }
    }

    // --- Media ---

    /// Shows a remote stream on the tile its sender occupies
    pub fn attach_remote(&mut self, remote: &str) {
        if let Some(tile) = self.view.boxes.iter_mut().find(|t| t.occupant_id() == Some(remote)) {
            tile.media = MediaState::Attached { remote: remote.to_string() };
        }
    }

    pub fn detach_remote(&mut self, remote: &str, unavailable: bool) {
        if let Some(tile) = self.view.boxes.iter_mut().find(|t| t.occupant_id() == Some(remote)) {
            tile.media = if unavailable { MediaState::Unavailable } else { MediaState::None };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{BoxState, UserInfo};

    fn participant(conn: &str) -> Participant {
        Participant::new(
            conn,
            UserInfo {
                id: format!("u-{conn}"),
                username: conn.to_string(),
                avatar: None,
            },
        )
    }

    fn state(occupants: &[(u8, &str)]) -> RoomState {
        RoomState {
            room_id: "s".to_string(),
            max_boxes: 4,
            host_user_id: None,
            boxes: (1..=4)
                .map(|id| BoxState {
                    id,
                    role: BoxRole::for_box(id),
                    occupied_by: occupants.iter().find(|(b, _)| *b == id).map(|(_, c)| participant(c)),
                })
                .collect(),
        }
    }

    fn model() -> RoomViewModel {
        let mut m = RoomViewModel::new("s", Duration::from_secs(10));
        m.set_connected("me");
        m
    }

    #[test]
    fn test_intent_gating() {
        let mut m = model();
        m.apply_room_state(&state(&[(1, "host")]));
        assert!(!m.can_join(1));
        assert!(m.can_join(2));
        assert!(!m.can_join(9));
        assert!(!m.can_leave(2));

        m.begin_join(2, Instant::now()).unwrap();
        // Only one join in flight
        assert!(m.begin_join(3, Instant::now()).is_err());

        m.apply_box_accepted(2, participant("me"));
        assert_eq!(m.local_box(), Some(2));
        assert!(!m.can_join(3));
        assert!(m.can_leave(2));
        assert_eq!(m.view().box_view(2).unwrap().media, MediaState::Local);
    }

    #[test]
    fn test_rejection_rolls_back_join() {
        let mut m = model();
        m.apply_room_state(&state(&[]));
        m.begin_join(2, Instant::now()).unwrap();
        m.apply_rejected(Some(2), "box_taken");
        assert_eq!(m.view().box_view(2).unwrap().pending, None);
        assert_eq!(m.view().notice.as_deref(), Some("box_taken"));
        assert!(m.can_join(2));
    }

    #[test]
    fn test_unconfirmed_join_expires() {
        let mut m = model();
        m.apply_room_state(&state(&[]));
        let start = Instant::now();
        m.begin_join(3, start).unwrap();
        assert!(m.expire_pending(start + Duration::from_secs(9)).is_empty());
        assert_eq!(m.expire_pending(start + Duration::from_secs(10)), vec![3]);
        assert!(m.can_join(3));
    }

    #[test]
    fn test_occupancy_only_from_relay_events() {
        let mut m = model();
        m.apply_room_state(&state(&[]));
        m.begin_join(2, Instant::now()).unwrap();
        assert!(m.view().box_view(2).unwrap().occupant.is_none());

        assert_eq!(m.apply_box_joined(3, participant("b")), None);
        assert_eq!(m.view().box_view(3).unwrap().occupant.as_ref().unwrap().connection_id, "b");
        assert_eq!(m.apply_box_left(3), Some("b".to_string()));
        assert!(m.view().box_view(3).unwrap().occupant.is_none());
    }

    #[test]
    fn test_occupant_change_drops_media() {
        let mut m = model();
        m.apply_room_state(&state(&[(2, "b")]));
        m.attach_remote("b");
        assert_eq!(m.view().box_view(2).unwrap().media, MediaState::Attached { remote: "b".to_string() });

        let superseded = m.apply_room_state(&state(&[(2, "c")]));
        assert_eq!(superseded, vec![Supersession { box_id: 2, previous: Some("b".to_string()) }]);
        assert_eq!(m.view().box_view(2).unwrap().media, MediaState::None);

        assert_eq!(m.apply_box_joined(2, participant("d")), Some("c".to_string()));
    }

    #[test]
    fn test_failed_link_marks_tile_unavailable() {
        let mut m = model();
        m.apply_room_state(&state(&[(2, "b"), (3, "me")]));
        assert_eq!(m.local_box(), Some(3));
        m.detach_remote("b", true);
        assert_eq!(m.view().box_view(2).unwrap().media, MediaState::Unavailable);
        // Own occupancy is untouched
        assert_eq!(m.local_box(), Some(3));
        assert_eq!(m.view().box_view(3).unwrap().media, MediaState::Local);
    }

    #[test]
    fn test_reset_forgets_local_occupancy() {
        let mut m = model();
        m.apply_room_state(&state(&[(2, "me")]));
        m.reset();
        assert_eq!(m.local_box(), None);
        assert!(!m.view().connected);
    }
}
