#![forbid(unsafe_code)]

// Client side of a room visit: peer negotiation, the box view and the
// session object that ties them to one signaling connection

pub mod driver;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod transport;
pub mod view;

pub use driver::{run, Intent};
pub use media::{LocalMedia, MediaDevices, MediaError};
pub use peer::{BackendEvent, CloseReason, LinkKey, LinkState, MediaBackend, PeerEvent, PeerSessionManager};
pub use rtc::{RemoteTrack, WebRtcBackend};
pub use session::RoomSession;
pub use transport::SignalingClient;
pub use view::{BoxView, MediaState, RoomView, RoomViewModel};

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("camera or microphone access denied: {0}")]
    DeviceDenied(String),
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("{0}")]
    Intent(String),
}

impl From<MediaError> for ClientError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::DeviceDenied(reason) => ClientError::DeviceDenied(reason),
            other => ClientError::Media(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL, e.g. `ws://localhost:3000/ws`
    pub server_url: String,
    /// Identity token appended as `?token=`
    pub token: Option<String>,
    /// Offers that stay unanswered this long are abandoned
    pub negotiation_timeout: Duration,
    /// Optimistic joins without confirmation are rolled back after this long
    pub join_confirm_timeout: Duration,
    pub reconnect_attempts: u32,
    /// Base delay between reconnect attempts, multiplied by the attempt number
    pub reconnect_delay: Duration,
    pub tick_interval: Duration,
    /// Ping period that keeps the relay from timing out a quiet connection.
    /// Must be non-zero and below the relay's idle timeout.
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3000/ws".to_string(),
            token: None,
            negotiation_timeout: Duration::from_secs(15),
            join_confirm_timeout: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
            tick_interval: Duration::from_millis(250),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// URL to dial, including the identity token when one is set
    pub fn connect_url(&self) -> String {
        match &self.token {
            Some(token) => {
                let sep = if self.server_url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.server_url, sep, token)
            }
            None => self.server_url.clone(),
        }
    }
}
