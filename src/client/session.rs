#![forbid(unsafe_code)]

// Room session - one visit to one room. Owns the local media lease, the
// peer session manager and the view model, and turns relay messages and
// user intents into outbound protocol messages.

use super::media::{LocalMedia, MediaDevices};
use super::peer::{BackendEvent, CloseReason, Effects, MediaBackend, PeerEvent, PeerSessionManager};
use super::view::{RoomView, RoomViewModel};
use super::{ClientConfig, ClientError};
use crate::room::UserInfo;
use crate::signaling::protocol::{ClientMessage, ServerMessage};
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct RoomSession<B: MediaBackend, D: MediaDevices> {
    room_id: String,
    max_boxes: Option<u8>,
    /// Declared identity, used when the relay does not verify tokens
    user: Option<UserInfo>,
    local_id: Option<String>,
    peers: PeerSessionManager<B>,
    view: RoomViewModel,
    devices: D,
    media: Option<LocalMedia>,
}

impl<B: MediaBackend, D: MediaDevices> RoomSession<B, D> {
    pub fn new(
        room_id: impl Into<String>,
        max_boxes: Option<u8>,
        user: Option<UserInfo>,
        backend: B,
        devices: D,
        config: &ClientConfig,
    ) -> Self {
        let room_id = room_id.into();
        Self {
            view: RoomViewModel::new(room_id.clone(), config.join_confirm_timeout),
            room_id,
            max_boxes,
            user,
            local_id: None,
            peers: PeerSessionManager::new(backend, config.negotiation_timeout),
            devices,
            media: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn view(&self) -> &RoomView {
        self.view.view()
    }

    pub fn peers(&self) -> &PeerSessionManager<B> {
        &self.peers
    }

    pub fn has_local_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.view.view().closed
    }

    fn release_media(&mut self) {
        if self.media.take().is_some() {
            info!("Released local media for room {}", self.room_id);
        }
    }

    /// Media is only kept while we hold a box or are about to
    fn release_media_if_idle(&mut self, joining: bool) {
        if self.view.local_box().is_none() && !joining {
            self.release_media();
        }
    }

    fn apply(&mut self, effects: Effects) -> Vec<ClientMessage> {
        for event in effects.events {
            match event {
                PeerEvent::Connected(key) => self.view.attach_remote(&key.remote),
                PeerEvent::Closed { key, reason } => {
                    self.view.detach_remote(&key.remote, reason.marks_unavailable())
                }
            }
        }
        effects.messages
    }

    /// Requests a box. Local media is acquired first; if the devices are
    /// denied nothing is sent and the view is unchanged.
    pub async fn request_join(&mut self, box_id: u8, now: Instant) -> Result<Vec<ClientMessage>, ClientError> {
        if !self.view.can_join(box_id) {
            return Err(ClientError::Intent(format!("box {box_id} cannot be joined right now")));
        }
        if self.media.is_none() {
            match self.devices.acquire().await {
                Ok(media) => self.media = Some(media),
                Err(e) => {
                    warn!("Cannot join box {}: {}", box_id, e);
                    self.view.set_notice(e.to_string());
                    return Err(e.into());
                }
            }
        }
        self.view.begin_join(box_id, now)?;
        Ok(vec![ClientMessage::JoinBox {
            room_id: self.room_id.clone(),
            box_id,
            user: self.user.clone(),
        }])
    }

    /// Leaves our box: every link is torn down and capture stops at once
    pub async fn request_leave(&mut self, box_id: u8, now: Instant) -> Result<Vec<ClientMessage>, ClientError> {
        self.view.begin_leave(box_id)?;
        let effects = self.peers.close_all(CloseReason::LocalLeave, now).await;
        let mut out = self.apply(effects);
        self.release_media();
        out.push(ClientMessage::LeaveBox {
            room_id: self.room_id.clone(),
            box_id,
        });
        Ok(out)
    }

    /// Handles one message from the relay, returning messages to send back
    pub async fn handle(&mut self, message: ServerMessage, now: Instant) -> Vec<ClientMessage> {
        match message {
            ServerMessage::Welcome { connection_id, ice_servers } => {
                info!("Connected to relay as {}", connection_id);
                self.peers.set_local_id(connection_id.clone());
                self.peers.configure_ice_servers(&ice_servers);
                self.view.set_connected(connection_id.clone());
                self.local_id = Some(connection_id);
                vec![ClientMessage::JoinStreamRoom {
                    room_id: self.room_id.clone(),
                    max_participants: self.max_boxes,
                }]
            }

            ServerMessage::RoomState(state) => {
                if state.room_id != self.room_id {
                    return vec![];
                }
                let superseded = self.view.apply_room_state(&state);
                let mut effects = Effects::default();
                for change in superseded {
                    effects.extend(
                        self.peers
                            .close_box(change.box_id, change.previous.as_deref(), CloseReason::OccupantChanged, now)
                            .await,
                    );
                }
                let out = self.apply(effects);
                let joining = self.view.view().boxes.iter().any(|b| b.pending.is_some());
                self.release_media_if_idle(joining);
                out
            }

            ServerMessage::BoxJoined { room_id, box_id, user, connection_id } => {
                if room_id != self.room_id {
                    return vec![];
                }
                let participant = crate::room::Participant::new(connection_id, user);
                match self.view.apply_box_joined(box_id, participant) {
                    Some(previous) => {
                        let effects = self
                            .peers
                            .close_box(box_id, Some(&previous), CloseReason::OccupantChanged, now)
                            .await;
                        self.apply(effects)
                    }
                    None => vec![],
                }
            }

            ServerMessage::BoxAccepted { room_id, box_id, participant } => {
                if room_id != self.room_id {
                    return vec![];
                }
                if self.media.is_none() {
                    // The join was abandoned locally before the relay confirmed it
                    info!("Late confirmation for box {}, giving it back", box_id);
                    return vec![ClientMessage::LeaveBox { room_id, box_id }];
                }
                self.view.apply_box_accepted(box_id, participant);
                vec![ClientMessage::RequestPeersForBox {
                    box_id,
                    room_id: Some(room_id),
                }]
            }

            ServerMessage::BoxLeft { room_id, box_id } => {
                if room_id != self.room_id {
                    return vec![];
                }
                let was_ours = self.view.local_box() == Some(box_id);
                let previous = self.view.apply_box_left(box_id);
                let effects = if was_ours {
                    self.peers.close_all(CloseReason::LocalLeave, now).await
                } else {
                    self.peers
                        .close_box(box_id, previous.as_deref(), CloseReason::BoxEmptied, now)
                        .await
                };
                let out = self.apply(effects);
                if was_ours {
                    self.release_media();
                }
                out
            }

            ServerMessage::PeersForBox { box_id, connection_ids } => {
                if self.view.local_box() != Some(box_id) {
                    debug!("Ignoring peer list for box {} we no longer hold", box_id);
                    return vec![];
                }
                let effects = self
                    .peers
                    .connect_to_peers(box_id, &connection_ids, self.media.as_ref(), now)
                    .await;
                self.apply(effects)
            }

            ServerMessage::SignalOffer { from_connection_id, box_id, offer, .. } => {
                let effects = self
                    .peers
                    .handle_offer(&from_connection_id, box_id, offer, self.media.as_ref(), now)
                    .await;
                self.apply(effects)
            }

            ServerMessage::SignalAnswer { from_connection_id, box_id, answer, .. } => {
                let effects = self.peers.handle_answer(&from_connection_id, box_id, answer, now).await;
                self.apply(effects)
            }

            ServerMessage::SignalIce { from_connection_id, candidate, box_id, .. } => {
                let effects = self
                    .peers
                    .handle_remote_candidate(&from_connection_id, box_id, candidate, now)
                    .await;
                self.apply(effects)
            }

            ServerMessage::Rejected { op, room_id, box_id, reason } => {
                warn!("Relay rejected {} (room {:?}, box {:?}): {}", op, room_id, box_id, reason);
                if op == "join-box" {
                    self.view.apply_rejected(box_id, &reason.to_string());
                    self.release_media_if_idle(false);
                } else {
                    self.view.set_notice(reason.to_string());
                }
                vec![]
            }

            ServerMessage::RoomClosed { room_id } => {
                if room_id != self.room_id {
                    return vec![];
                }
                info!("Room {} was closed by the host", room_id);
                let effects = self.peers.close_all(CloseReason::Shutdown, now).await;
                let out = self.apply(effects);
                self.view.mark_closed();
                self.release_media();
                out
            }

            ServerMessage::Error { message } => {
                warn!("Relay error: {}", message);
                self.view.set_notice(message);
                vec![]
            }
        }
    }

    pub async fn handle_backend_event(&mut self, event: BackendEvent, now: Instant) -> Vec<ClientMessage> {
        let effects = self.peers.handle_backend_event(event, now).await;
        self.apply(effects)
    }

    /// Periodic housekeeping: negotiation timeouts and unconfirmed joins
    pub async fn tick(&mut self, now: Instant) -> Vec<ClientMessage> {
        let effects = self.peers.poll_timeouts(now).await;
        let out = self.apply(effects);
        if !self.view.expire_pending(now).is_empty() {
            self.release_media_if_idle(false);
        }
        out
    }

    /// Signaling connection lost. Links cannot survive a new connection id,
    /// so everything is torn down and rebuilt from the next room-state.
    pub async fn on_transport_lost(&mut self, now: Instant) {
        warn!("Lost relay connection for room {}", self.room_id);
        let effects = self.peers.close_all(CloseReason::Disconnected, now).await;
        self.apply(effects);
        self.view.reset();
        self.local_id = None;
        self.release_media();
    }

    /// Leaves the room for good
    pub async fn exit(&mut self, now: Instant) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        if let Some(box_id) = self.view.local_box() {
            out.push(ClientMessage::LeaveBox {
                room_id: self.room_id.clone(),
                box_id,
            });
        }
        if self.local_id.is_some() {
            out.push(ClientMessage::LeaveStreamRoom {
                room_id: self.room_id.clone(),
            });
        }
        let effects = self.peers.close_all(CloseReason::Shutdown, now).await;
        out.extend(self.apply(effects));
        self.release_media();
        info!("Left room {}", self.room_id);
        out
    }
}
