#![forbid(unsafe_code)]

// webrtc-rs backend - one RTCPeerConnection per peer link. Session
// descriptions and candidates cross the relay as their JSON forms.

use super::media::{LocalMedia, MediaError};
use super::peer::{BackendEvent, LinkKey, MediaBackend};
use crate::turn::IceServer;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

const EVENT_CAPACITY: usize = 256;

/// A remote track arriving on a link, for the application to render
pub struct RemoteTrack {
    pub key: LinkKey,
    pub track: Arc<TrackRemote>,
}

fn backend_err(e: impl std::fmt::Display) -> MediaError {
    MediaError::Backend(e.to_string())
}

pub struct WebRtcBackend {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    sessions: HashMap<LinkKey, Arc<RTCPeerConnection>>,
    events: mpsc::Sender<BackendEvent>,
    tracks: mpsc::Sender<RemoteTrack>,
}

impl WebRtcBackend {
    /// Builds the backend with the default codecs and interceptors. Returns
    /// the receivers for callback events and remote tracks.
    pub fn new() -> Result<(Self, mpsc::Receiver<BackendEvent>, mpsc::Receiver<RemoteTrack>), MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend_err)?;
        let registry = register_default_interceptors(Default::default(), &mut media_engine).map_err(backend_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (tracks_tx, tracks_rx) = mpsc::channel(EVENT_CAPACITY);
        Ok((
            Self {
                api,
                ice_servers: Vec::new(),
                sessions: HashMap::new(),
                events: events_tx,
                tracks: tracks_tx,
            },
            events_rx,
            tracks_rx,
        ))
    }

    fn session(&self, key: &LinkKey) -> Result<Arc<RTCPeerConnection>, MediaError> {
        self.sessions
            .get(key)
            .cloned()
            .ok_or_else(|| MediaError::Backend(format!("no session for {} in box {}", key.remote, key.box_id)))
    }

    fn watch_session(&self, key: &LinkKey, pc: &RTCPeerConnection) {
        let events = self.events.clone();
        let candidate_key = key.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let key = candidate_key.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let encoded = candidate
                    .to_json()
                    .map_err(backend_err)
                    .and_then(|init| serde_json::to_value(init).map_err(backend_err));
                match encoded {
                    Ok(candidate) => {
                        let _ = events.send(BackendEvent::LocalCandidate { key, candidate }).await;
                    }
                    Err(e) => warn!("Dropping local candidate for {}: {}", key.remote, e),
                }
            })
        }));

        let events = self.events.clone();
        let state_key = key.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let key = state_key.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        info!("Peer connection to {} for box {} is up", key.remote, key.box_id)
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = events
                            .send(BackendEvent::Failed {
                                key,
                                reason: "peer connection failed".to_string(),
                            })
                            .await;
                    }
                    other => debug!("Peer connection to {}: {:?}", key.remote, other),
                }
            })
        }));

        // The handler must return promptly; rendering happens on the receiver side
        let tracks = self.tracks.clone();
        let track_key = key.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = RemoteTrack {
                key: track_key.clone(),
                track,
            };
            if tracks.try_send(remote).is_err() {
                warn!("Remote track from {} dropped, receiver is not keeping up", track_key.remote);
            }
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn open(&mut self, key: &LinkKey, local: Option<&LocalMedia>) -> Result<(), MediaError> {
        if let Some(stale) = self.sessions.remove(key) {
            let _ = stale.close().await;
        }

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend_err)?);

        match local {
            Some(media) => {
                for track in media.tracks() {
                    let sender = pc.add_track(Arc::clone(track)).await.map_err(backend_err)?;
                    // RTCP has to be drained for interceptors to work
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 1500];
                        while sender.read(&mut buf).await.is_ok() {}
                    });
                }
            }
            None => {
                for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                    let init = RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    };
                    pc.add_transceiver_from_kind(kind, Some(init)).await.map_err(backend_err)?;
                }
            }
        }

        self.watch_session(key, &pc);
        self.sessions.insert(key.clone(), pc);
        Ok(())
    }

    async fn create_offer(&mut self, key: &LinkKey) -> Result<Value, MediaError> {
        let pc = self.session(key)?;
        let offer = pc.create_offer(None).await.map_err(backend_err)?;
        pc.set_local_description(offer.clone()).await.map_err(backend_err)?;
        serde_json::to_value(offer).map_err(backend_err)
    }

    async fn accept_offer(&mut self, key: &LinkKey, offer: Value) -> Result<Value, MediaError> {
        let pc = self.session(key)?;
        let offer: RTCSessionDescription = serde_json::from_value(offer).map_err(backend_err)?;
        pc.set_remote_description(offer).await.map_err(backend_err)?;
        let answer = pc.create_answer(None).await.map_err(backend_err)?;
        pc.set_local_description(answer.clone()).await.map_err(backend_err)?;
        serde_json::to_value(answer).map_err(backend_err)
    }

    async fn accept_answer(&mut self, key: &LinkKey, answer: Value) -> Result<(), MediaError> {
        let pc = self.session(key)?;
        let answer: RTCSessionDescription = serde_json::from_value(answer).map_err(backend_err)?;
        pc.set_remote_description(answer).await.map_err(backend_err)
    }

    async fn add_remote_candidate(&mut self, key: &LinkKey, candidate: Value) -> Result<(), MediaError> {
        let pc = self.session(key)?;
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate).map_err(backend_err)?;
        pc.add_ice_candidate(candidate).await.map_err(backend_err)
    }

    async fn close(&mut self, key: &LinkKey) {
        if let Some(pc) = self.sessions.remove(key) {
            if let Err(e) = pc.close().await {
                debug!("Error closing peer connection to {}: {}", key.remote, e);
            }
        }
    }

    fn configure_ice_servers(&mut self, servers: &[IceServer]) {
        self.ice_servers = servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ice_servers_carry_turn_credentials() {
        let (mut backend, _events, _tracks) = WebRtcBackend::new().unwrap();
        backend.configure_ice_servers(&[IceServer {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: Some("1700000000:conn".to_string()),
            credential: Some("secret".to_string()),
        }]);
        assert_eq!(backend.ice_servers.len(), 1);
        assert_eq!(backend.ice_servers[0].username, "1700000000:conn");
        assert_eq!(backend.ice_servers[0].credential, "secret");
    }

    #[tokio::test]
    async fn test_unknown_link_is_an_error() {
        let (mut backend, _events, _tracks) = WebRtcBackend::new().unwrap();
        let key = LinkKey::new("nobody", 2);
        assert!(matches!(backend.create_offer(&key).await, Err(MediaError::Backend(_))));
        // Closing an unknown link is a no-op
        backend.close(&key).await;
    }

    #[tokio::test]
    async fn test_receive_only_offer() {
        let (mut backend, _events, _tracks) = WebRtcBackend::new().unwrap();
        let key = LinkKey::new("host", 2);
        backend.open(&key, None).await.unwrap();

        let offer = backend.create_offer(&key).await.unwrap();
        assert_eq!(offer["type"], "offer");
        let sdp = offer["sdp"].as_str().unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));

        assert!(backend.add_remote_candidate(&key, json!(42)).await.is_err());
        backend.close(&key).await;
        assert!(backend.sessions.is_empty());
    }
}
