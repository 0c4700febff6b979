#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication.
// Every message is a JSON object tagged by `type`; session descriptions and
// ICE candidates are opaque to the relay.

use crate::room::{Participant, Rejection, RoomState, UserInfo};
use crate::turn::IceServer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Subscribe to a room's events (creates the room if unknown)
    #[serde(rename_all = "camelCase")]
    JoinStreamRoom {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_participants: Option<u8>,
    },
    /// Stop receiving a room's events
    #[serde(rename_all = "camelCase")]
    LeaveStreamRoom {
        room_id: String,
    },
    /// Claim a box. `user` is only honored when the relay runs without
    /// token verification.
    #[serde(rename_all = "camelCase")]
    JoinBox {
        room_id: String,
        box_id: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserInfo>,
    },
    /// Release a box
    #[serde(rename_all = "camelCase")]
    LeaveBox {
        room_id: String,
        box_id: u8,
    },
    /// Ask for the connections to negotiate with after joining a box
    #[serde(rename_all = "camelCase")]
    RequestPeersForBox {
        box_id: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SignalOffer {
        to_connection_id: String,
        from_connection_id: String,
        box_id: u8,
        offer: Value,
    },
    #[serde(rename_all = "camelCase")]
    SignalAnswer {
        to_connection_id: String,
        from_connection_id: String,
        box_id: u8,
        answer: Value,
    },
    #[serde(rename_all = "camelCase")]
    SignalIce {
        to_connection_id: String,
        candidate: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        box_id: Option<u8>,
    },
    /// Host ends the stream, closing the room for everyone
    #[serde(rename_all = "camelCase")]
    EndStream {
        room_id: String,
    },
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinStreamRoom { .. } => "join-stream-room",
            ClientMessage::LeaveStreamRoom { .. } => "leave-stream-room",
            ClientMessage::JoinBox { .. } => "join-box",
            ClientMessage::LeaveBox { .. } => "leave-box",
            ClientMessage::RequestPeersForBox { .. } => "request-peers-for-box",
            ClientMessage::SignalOffer { .. } => "signal-offer",
            ClientMessage::SignalAnswer { .. } => "signal-answer",
            ClientMessage::SignalIce { .. } => "signal-ice",
            ClientMessage::EndStream { .. } => "end-stream",
        }
    }
}

/// Server-to-Client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First message on every connection
    #[serde(rename_all = "camelCase")]
    Welcome {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServer>,
    },
    /// Full authoritative room state
    RoomState(RoomState),
    /// Someone else took a box
    #[serde(rename_all = "camelCase")]
    BoxJoined {
        room_id: String,
        box_id: u8,
        user: UserInfo,
        connection_id: String,
    },
    /// Confirmation to the joiner that the box is theirs
    #[serde(rename_all = "camelCase")]
    BoxAccepted {
        room_id: String,
        box_id: u8,
        participant: Participant,
    },
    #[serde(rename_all = "camelCase")]
    BoxLeft {
        room_id: String,
        box_id: u8,
    },
    #[serde(rename_all = "camelCase")]
    PeersForBox {
        box_id: u8,
        connection_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    SignalOffer {
        to_connection_id: String,
        from_connection_id: String,
        box_id: u8,
        offer: Value,
    },
    #[serde(rename_all = "camelCase")]
    SignalAnswer {
        to_connection_id: String,
        from_connection_id: String,
        box_id: u8,
        answer: Value,
    },
    #[serde(rename_all = "camelCase")]
    SignalIce {
        to_connection_id: String,
        from_connection_id: String,
        candidate: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        box_id: Option<u8>,
    },
    /// A request was refused by the registry
    #[serde(rename_all = "camelCase")]
    Rejected {
        op: String,
        room_id: Option<String>,
        box_id: Option<u8>,
        reason: Rejection,
    },
    #[serde(rename_all = "camelCase")]
    RoomClosed {
        room_id: String,
    },
    Error {
        message: String,
    },
}
