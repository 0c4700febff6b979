#![forbid(unsafe_code)]

// Shared room data: occupants, snapshots, and rejection reasons

use super::roles::BoxRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Box counts a multi-host stream may be created with.
pub const ALLOWED_BOX_COUNTS: [u8; 5] = [2, 4, 6, 9, 12];

/// Identity snapshot of a user, copied into a box when they join it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A connection occupying a box
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: String,
    pub user: UserInfo,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(connection_id: impl Into<String>, user: UserInfo) -> Self {
        Self {
            connection_id: connection_id.into(),
            user,
            joined_at: Utc::now(),
        }
    }
}

/// One box in a room snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxState {
    pub id: u8,
    pub role: BoxRole,
    pub occupied_by: Option<Participant>,
}

/// Authoritative view of a room's boxes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub max_boxes: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_user_id: Option<String>,
    pub boxes: Vec<BoxState>,
}

impl RoomState {
    pub fn occupant(&self, box_id: u8) -> Option<&Participant> {
        self.boxes
            .iter()
            .find(|b| b.id == box_id)
            .and_then(|b| b.occupied_by.as_ref())
    }
}

/// Reasons the registry refuses a request. Returned to the caller only.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    #[error("box is already occupied")]
    BoxTaken,
    #[error("box id is outside the room layout")]
    InvalidBox,
    #[error("connection already occupies a box in this room")]
    AlreadyInRoom,
    #[error("caller does not occupy this box")]
    NotOccupant,
    #[error("room not found")]
    RoomNotFound,
    #[error("box 1 is reserved for the room host")]
    ReservedForHost,
    #[error("only the host may do this")]
    NotHost,
    #[error("unsupported box count")]
    InvalidLayout,
}

/// Validates a requested box count against the supported layouts.
pub fn validate_layout(max_boxes: u8) -> Result<u8, Rejection> {
    if ALLOWED_BOX_COUNTS.contains(&max_boxes) {
        Ok(max_boxes)
    } else {
        Err(Rejection::InvalidLayout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts() {
        for n in ALLOWED_BOX_COUNTS {
            assert_eq!(validate_layout(n), Ok(n));
        }
        assert_eq!(validate_layout(0), Err(Rejection::InvalidLayout));
        assert_eq!(validate_layout(3), Err(Rejection::InvalidLayout));
        assert_eq!(validate_layout(13), Err(Rejection::InvalidLayout));
    }

    #[test]
    fn test_rejection_wire_names() {
        assert_eq!(serde_json::to_string(&Rejection::BoxTaken).unwrap(), "\"box_taken\"");
        assert_eq!(serde_json::to_string(&Rejection::AlreadyInRoom).unwrap(), "\"already_in_room\"");
        assert_eq!(serde_json::to_string(&Rejection::NotOccupant).unwrap(), "\"not_occupant\"");
        let parsed: Rejection = serde_json::from_str("\"invalid_box\"").unwrap();
        assert_eq!(parsed, Rejection::InvalidBox);
    }
}
