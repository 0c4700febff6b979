#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Role attached to a box slot. Box 1 belongs to the broadcaster who first
/// takes it; every other slot is a co-host seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoxRole {
    CoHost,
    Host,
}

impl BoxRole {
    pub fn for_box(box_id: u8) -> Self {
        if box_id == HOST_BOX {
            BoxRole::Host
        } else {
            BoxRole::CoHost
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BoxRole::Host => "host",
            BoxRole::CoHost => "co-host",
        }
    }

    /// Whether the occupant of a box with this role may end the stream.
    pub fn can_end_stream(&self) -> bool {
        *self == BoxRole::Host
    }

    /// Whether a user may sit in a box with this role. Host boxes are
    /// reserved for the room's host once one has claimed box 1.
    pub fn admits(&self, user_id: &str, host_user_id: Option<&str>) -> bool {
        match (self, host_user_id) {
            (BoxRole::Host, Some(host)) => host == user_id,
            _ => true,
        }
    }
}

pub const HOST_BOX: u8 = 1;
