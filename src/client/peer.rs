#![forbid(unsafe_code)]

// Peer session manager - drives offer/answer/ICE for every peer link of one
// client and owns the backend session behind each link

use super::media::{LocalMedia, MediaError};
use crate::signaling::protocol::ClientMessage;
use crate::turn::IceServer;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Closed links are remembered this long so late answers are recognised as stale
const TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// Identifies a peer link: the remote connection and the box the
/// negotiation was started for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    pub remote: String,
    pub box_id: u8,
}

impl LinkKey {
    pub fn new(remote: impl Into<String>, box_id: u8) -> Self {
        Self { remote: remote.into(), box_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The box the link was negotiated for emptied
    BoxEmptied,
    /// The box changed hands
    OccupantChanged,
    LocalLeave,
    /// No answer within the negotiation timeout
    Timeout,
    TransportFailed,
    /// Replaced by a newer negotiation with the same remote
    Superseded,
    /// Signaling connection lost
    Disconnected,
    Shutdown,
}

impl CloseReason {
    /// Whether the remote's tile should show its media as unavailable
    pub fn marks_unavailable(&self) -> bool {
        matches!(self, CloseReason::Timeout | CloseReason::TransportFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(LinkKey),
    Closed { key: LinkKey, reason: CloseReason },
}

/// Events a backend reports from its own callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    LocalCandidate { key: LinkKey, candidate: Value },
    Failed { key: LinkKey, reason: String },
}

/// Peer-connection engine. One session per link key.
#[async_trait]
pub trait MediaBackend: Send {
    /// Creates the session for a link, attaching local media if any
    async fn open(&mut self, key: &LinkKey, local: Option<&LocalMedia>) -> Result<(), MediaError>;
    async fn create_offer(&mut self, key: &LinkKey) -> Result<Value, MediaError>;
    /// Applies a remote offer and returns the local answer
    async fn accept_offer(&mut self, key: &LinkKey, offer: Value) -> Result<Value, MediaError>;
    async fn accept_answer(&mut self, key: &LinkKey, answer: Value) -> Result<(), MediaError>;
    async fn add_remote_candidate(&mut self, key: &LinkKey, candidate: Value) -> Result<(), MediaError>;
    /// Releases the session. Closing an unknown key is a no-op.
    async fn close(&mut self, key: &LinkKey);

    fn configure_ice_servers(&mut self, _servers: &[IceServer]) {}
}

/// Outbound messages and view-relevant events produced by one step
#[derive(Debug, Default, PartialEq)]
pub struct Effects {
    pub messages: Vec<ClientMessage>,
    pub events: Vec<PeerEvent>,
}

impl Effects {
    pub fn extend(&mut self, other: Effects) {
        self.messages.extend(other.messages);
        self.events.extend(other.events);
    }
}

#[derive(Debug)]
struct PeerLink {
    state: LinkState,
    role: Role,
    remote_description_set: bool,
    pending_candidates: Vec<Value>,
    started_at: Instant,
    closed_at: Option<Instant>,
}

impl PeerLink {
    fn new(role: Role, now: Instant) -> Self {
        Self {
            state: LinkState::Negotiating,
            role,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            started_at: now,
            closed_at: None,
        }
    }

    fn is_active(&self) -> bool {
        self.state != LinkState::Closed
    }
}

pub struct PeerSessionManager<B: MediaBackend> {
    backend: B,
    local_id: Option<String>,
    links: HashMap<LinkKey, PeerLink>,
    negotiation_timeout: Duration,
}

impl<B: MediaBackend> PeerSessionManager<B> {
    pub fn new(backend: B, negotiation_timeout: Duration) -> Self {
        Self {
            backend,
            local_id: None,
            links: HashMap::new(),
            negotiation_timeout,
        }
    }

    pub fn set_local_id(&mut self, connection_id: impl Into<String>) {
        self.local_id = Some(connection_id.into());
    }

    pub fn configure_ice_servers(&mut self, servers: &[IceServer]) {
        self.backend.configure_ice_servers(servers);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn link_state(&self, key: &LinkKey) -> Option<LinkState> {
        self.links.get(key).map(|l| l.state)
    }

    /// Keys of links that are negotiating or connected
    pub fn active_links(&self) -> Vec<LinkKey> {
        let mut keys: Vec<LinkKey> = self
            .links
            .iter()
            .filter(|(_, l)| l.is_active())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn active_link_to(&self, remote: &str) -> Option<(&LinkKey, &PeerLink)> {
        self.links.iter().find(|(k, l)| k.remote == remote && l.is_active())
    }

    async fn close_link(&mut self, key: &LinkKey, reason: CloseReason, now: Instant, effects: &mut Effects) {
        let Some(link) = self.links.get_mut(key) else {
            return;
        };
        if !link.is_active() {
            return;
        }
        link.state = LinkState::Closed;
        link.closed_at = Some(now);
        link.pending_candidates.clear();
        self.backend.close(key).await;
        debug!("Closed link to {} for box {}: {:?}", key.remote, key.box_id, reason);
        effects.events.push(PeerEvent::Closed { key: key.clone(), reason });
    }

    /// Starts negotiating with every peer returned for our box. Peers we
    /// already have a live link with are skipped.
    pub async fn connect_to_peers(
        &mut self,
        box_id: u8,
        peers: &[String],
        local: Option<&LocalMedia>,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        for remote in peers {
            if Some(remote) == self.local_id.as_ref() || self.active_link_to(remote).is_some() {
                continue;
            }
            let key = LinkKey::new(remote.clone(), box_id);
            self.links.insert(key.clone(), PeerLink::new(Role::Initiator, now));

            let offer = match self.backend.open(&key, local).await {
                Ok(()) => self.backend.create_offer(&key).await,
                Err(e) => Err(e),
            };
            match offer {
                Ok(offer) => {
                    debug!("Sending offer to {} for box {}", remote, box_id);
                    effects.messages.push(ClientMessage::SignalOffer {
                        to_connection_id: remote.clone(),
                        from_connection_id: self.local_id.clone().unwrap_or_default(),
                        box_id,
                        offer,
                    });
                }
                Err(e) => {
                    warn!("Failed to start negotiation with {}: {}", remote, e);
                    self.close_link(&key, CloseReason::TransportFailed, now, &mut effects).await;
                }
            }
        }
        effects
    }

    /// Responds to a remote offer. A stale link for the same key is
    /// replaced. When both sides offered at once, the side with the lower
    /// connection id keeps its own offer.
    pub async fn handle_offer(
        &mut self,
        from: &str,
        box_id: u8,
        offer: Value,
        local: Option<&LocalMedia>,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        let key = LinkKey::new(from, box_id);

        let glare = self
            .active_link_to(from)
            .filter(|(_, l)| l.role == Role::Initiator && l.state == LinkState::Negotiating)
            .map(|(k, _)| k.clone());
        if let Some(ours) = glare {
            let we_win = self.local_id.as_deref().is_some_and(|local_id| local_id < from);
            if we_win {
                debug!("Offer collision with {}, keeping ours", from);
                return effects;
            }
            self.close_link(&ours, CloseReason::Superseded, now, &mut effects).await;
        }

        let stale: Vec<LinkKey> = self
            .links
            .iter()
            .filter(|(k, l)| k.remote == from && l.is_active())
            .map(|(k, _)| k.clone())
            .collect();
        for old in stale {
            self.close_link(&old, CloseReason::Superseded, now, &mut effects).await;
        }

        self.links.insert(key.clone(), PeerLink::new(Role::Responder, now));
        let answer = match self.backend.open(&key, local).await {
            Ok(()) => self.backend.accept_offer(&key, offer).await,
            Err(e) => Err(e),
        };
        match answer {
            Ok(answer) => {
                effects.messages.push(ClientMessage::SignalAnswer {
                    to_connection_id: from.to_string(),
                    from_connection_id: self.local_id.clone().unwrap_or_default(),
                    box_id,
                    answer,
                });
                self.mark_connected(&key, &mut effects, now).await;
            }
            Err(e) => {
                warn!("Failed to answer offer from {}: {}", from, e);
                self.close_link(&key, CloseReason::TransportFailed, now, &mut effects).await;
            }
        }
        effects
    }

    /// Applies an answer. Answers for absent, closed or already connected
    /// links are stale and change nothing.
    pub async fn handle_answer(&mut self, from: &str, box_id: u8, answer: Value, now: Instant) -> Effects {
        let mut effects = Effects::default();
        let key = LinkKey::new(from, box_id);
        let expecting = self
            .links
            .get(&key)
            .is_some_and(|l| l.state == LinkState::Negotiating && l.role == Role::Initiator);
        if !expecting {
            debug!("Ignoring stale answer from {} for box {}", from, box_id);
            return effects;
        }

        match self.backend.accept_answer(&key, answer).await {
            Ok(()) => self.mark_connected(&key, &mut effects, now).await,
            Err(e) => {
                warn!("Failed to apply answer from {}: {}", from, e);
                self.close_link(&key, CloseReason::TransportFailed, now, &mut effects).await;
            }
        }
        effects
    }

    async fn mark_connected(&mut self, key: &LinkKey, effects: &mut Effects, now: Instant) {
        let pending = match self.links.get_mut(key) {
            Some(link) => {
                link.remote_description_set = true;
                link.state = LinkState::Connected;
                std::mem::take(&mut link.pending_candidates)
            }
            None => return,
        };
        info!("Link to {} for box {} connected", key.remote, key.box_id);
        effects.events.push(PeerEvent::Connected(key.clone()));

        for candidate in pending {
            if let Err(e) = self.backend.add_remote_candidate(key, candidate).await {
                warn!("Failed to apply buffered candidate from {}: {}", key.remote, e);
                self.close_link(key, CloseReason::TransportFailed, now, effects).await;
                return;
            }
        }
    }

    /// Applies a remote ICE candidate, buffering it until the remote
    /// description is set. Without a box id the candidate goes to the live
    /// link with that remote.
    pub async fn handle_remote_candidate(
        &mut self,
        from: &str,
        box_id: Option<u8>,
        candidate: Value,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        let key = match box_id {
            Some(box_id) => LinkKey::new(from, box_id),
            None => match self.active_link_to(from) {
                Some((key, _)) => key.clone(),
                None => {
                    debug!("Ignoring candidate from {} with no live link", from);
                    return effects;
                }
            },
        };

        let Some(link) = self.links.get_mut(&key).filter(|l| l.is_active()) else {
            debug!("Ignoring stale candidate from {} for box {}", from, key.box_id);
            return effects;
        };
        if !link.remote_description_set {
            link.pending_candidates.push(candidate);
            return effects;
        }
        if let Err(e) = self.backend.add_remote_candidate(&key, candidate).await {
            warn!("Failed to apply candidate from {}: {}", from, e);
            self.close_link(&key, CloseReason::TransportFailed, now, &mut effects).await;
        }
        effects
    }

    pub async fn handle_backend_event(&mut self, event: BackendEvent, now: Instant) -> Effects {
        let mut effects = Effects::default();
        match event {
            BackendEvent::LocalCandidate { key, candidate } => {
                if self.links.get(&key).is_some_and(|l| l.is_active()) {
                    effects.messages.push(ClientMessage::SignalIce {
                        to_connection_id: key.remote.clone(),
                        candidate,
                        box_id: Some(key.box_id),
                    });
                }
            }
            BackendEvent::Failed { key, reason } => {
                warn!("Transport to {} for box {} failed: {}", key.remote, key.box_id, reason);
                self.close_link(&key, CloseReason::TransportFailed, now, &mut effects).await;
            }
        }
        effects
    }

    /// Closes every link tied to a box or to the box's previous occupant.
    pub async fn close_box(
        &mut self,
        box_id: u8,
        previous_occupant: Option<&str>,
        reason: CloseReason,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        let keys: Vec<LinkKey> = self
            .links
            .iter()
            .filter(|(k, l)| {
                l.is_active() && (k.box_id == box_id || previous_occupant == Some(k.remote.as_str()))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.close_link(&key, reason, now, &mut effects).await;
        }
        effects
    }

    pub async fn close_all(&mut self, reason: CloseReason, now: Instant) -> Effects {
        let mut effects = Effects::default();
        for key in self.active_links() {
            self.close_link(&key, reason, now, &mut effects).await;
        }
        effects
    }

    /// Abandons negotiations that outlived the timeout and forgets old
    /// tombstones.
    pub async fn poll_timeouts(&mut self, now: Instant) -> Effects {
        let mut effects = Effects::default();
        let expired: Vec<LinkKey> = self
            .links
            .iter()
            .filter(|(_, l)| {
                l.state == LinkState::Negotiating
                    && now.saturating_duration_since(l.started_at) >= self.negotiation_timeout
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            info!("Negotiation with {} for box {} timed out", key.remote, key.box_id);
            self.close_link(&key, CloseReason::Timeout, now, &mut effects).await;
        }

        self.links.retain(|_, l| {
            !l.closed_at
                .is_some_and(|closed| now.saturating_duration_since(closed) >= TOMBSTONE_TTL)
        });
        effects
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;
    use serde_json::json;

    fn manager(local_id: &str) -> PeerSessionManager<FakeBackend> {
        let mut m = PeerSessionManager::new(FakeBackend::default(), Duration::from_secs(15));
        m.set_local_id(local_id);
        m
    }

    fn cand(n: u32) -> Value {
        json!({ "candidate": format!("candidate:{n} 1 udp 1 10.0.0.1 500{n} typ host") })
    }

    #[tokio::test]
    async fn test_initiator_offer_answer_connects() {
        let now = Instant::now();
        let mut m = manager("a");
        let effects = m.connect_to_peers(2, &["b".to_string(), "a".to_string()], None, now).await;
        assert_eq!(effects.messages.len(), 1);
        assert!(matches!(
            &effects.messages[0],
            ClientMessage::SignalOffer { to_connection_id, from_connection_id, box_id: 2, .. }
                if to_connection_id == "b" && from_connection_id == "a"
        ));
        let key = LinkKey::new("b", 2);
        assert_eq!(m.link_state(&key), Some(LinkState::Negotiating));

        let effects = m.handle_answer("b", 2, json!({"type": "answer"}), now).await;
        assert_eq!(effects.events, vec![PeerEvent::Connected(key.clone())]);
        assert_eq!(m.link_state(&key), Some(LinkState::Connected));

        // A live link is not renegotiated
        let effects = m.connect_to_peers(2, &["b".to_string()], None, now).await;
        assert!(effects.messages.is_empty());
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let now = Instant::now();
        let mut m = manager("a");
        m.connect_to_peers(2, &["b".to_string()], None, now).await;
        m.handle_remote_candidate("b", Some(2), cand(1), now).await;
        m.handle_remote_candidate("b", None, cand(2), now).await;
        assert!(m.backend().applied_candidates.is_empty());

        m.handle_answer("b", 2, json!({}), now).await;
        let applied: Vec<Value> = m.backend().applied_candidates.iter().map(|(_, c)| c.clone()).collect();
        assert_eq!(applied, vec![cand(1), cand(2)]);

        m.handle_remote_candidate("b", Some(2), cand(3), now).await;
        assert_eq!(m.backend().applied_candidates.len(), 3);
    }

    #[tokio::test]
    async fn test_answer_after_box_left_is_stale() {
        let now = Instant::now();
        let mut m = manager("a");
        m.connect_to_peers(3, &["b".to_string()], None, now).await;
        let effects = m.close_box(3, None, CloseReason::BoxEmptied, now).await;
        let key = LinkKey::new("b", 3);
        assert_eq!(
            effects.events,
            vec![PeerEvent::Closed { key: key.clone(), reason: CloseReason::BoxEmptied }]
        );

        let effects = m.handle_answer("b", 3, json!({}), now).await;
        assert!(effects.events.is_empty());
        assert_eq!(m.link_state(&key), Some(LinkState::Closed));
        assert_eq!(m.backend().closed, vec![key]);
    }

    #[tokio::test]
    async fn test_unanswered_offer_times_out() {
        let now = Instant::now();
        let mut m = manager("a");
        m.connect_to_peers(2, &["b".to_string()], None, now).await;

        let effects = m.poll_timeouts(now + Duration::from_secs(14)).await;
        assert!(effects.events.is_empty());

        let effects = m.poll_timeouts(now + Duration::from_secs(15)).await;
        let key = LinkKey::new("b", 2);
        assert_eq!(effects.events, vec![PeerEvent::Closed { key: key.clone(), reason: CloseReason::Timeout }]);
        assert!(CloseReason::Timeout.marks_unavailable());

        // Tombstone is forgotten eventually
        m.poll_timeouts(now + Duration::from_secs(15) + TOMBSTONE_TTL).await;
        assert_eq!(m.link_state(&key), None);
    }

    #[tokio::test]
    async fn test_responder_answers_and_replaces_stale_link() {
        let now = Instant::now();
        let mut m = manager("b");
        let effects = m.handle_offer("a", 2, json!({"type": "offer"}), None, now).await;
        assert!(matches!(
            &effects.messages[0],
            ClientMessage::SignalAnswer { to_connection_id, box_id: 2, .. } if to_connection_id == "a"
        ));
        assert_eq!(effects.events, vec![PeerEvent::Connected(LinkKey::new("a", 2))]);

        // A renegotiation from the same remote replaces the old session
        let effects = m.handle_offer("a", 2, json!({"type": "offer"}), None, now).await;
        assert_eq!(effects.events[0], PeerEvent::Closed { key: LinkKey::new("a", 2), reason: CloseReason::Superseded });
        assert_eq!(effects.events[1], PeerEvent::Connected(LinkKey::new("a", 2)));
        assert_eq!(m.active_links(), vec![LinkKey::new("a", 2)]);
    }

    #[tokio::test]
    async fn test_offer_collision_tie_break() {
        let now = Instant::now();
        // Lower id keeps its own offer
        let mut low = manager("a");
        low.connect_to_peers(2, &["b".to_string()], None, now).await;
        let effects = low.handle_offer("b", 3, json!({}), None, now).await;
        assert!(effects.messages.is_empty());
        assert_eq!(low.active_links(), vec![LinkKey::new("b", 2)]);

        // Higher id yields and answers
        let mut high = manager("b");
        high.connect_to_peers(3, &["a".to_string()], None, now).await;
        let effects = high.handle_offer("a", 2, json!({}), None, now).await;
        assert_eq!(effects.messages.len(), 1);
        assert_eq!(high.active_links(), vec![LinkKey::new("a", 2)]);
        assert_eq!(high.link_state(&LinkKey::new("a", 3)), Some(LinkState::Closed));
    }

    #[tokio::test]
    async fn test_close_box_includes_previous_occupant_links() {
        let now = Instant::now();
        let mut m = manager("a");
        m.connect_to_peers(1, &["b".to_string(), "c".to_string()], None, now).await;
        // c held box 4 and was replaced; our link to c is keyed on our box
        let effects = m.close_box(4, Some("c"), CloseReason::OccupantChanged, now).await;
        assert_eq!(effects.events.len(), 1);
        assert_eq!(m.active_links(), vec![LinkKey::new("b", 1)]);
    }

    #[tokio::test]
    async fn test_backend_events() {
        let now = Instant::now();
        let mut m = manager("a");
        m.connect_to_peers(2, &["b".to_string()], None, now).await;
        let key = LinkKey::new("b", 2);

        let effects = m
            .handle_backend_event(BackendEvent::LocalCandidate { key: key.clone(), candidate: cand(1) }, now)
            .await;
        assert_eq!(
            effects.messages,
            vec![ClientMessage::SignalIce { to_connection_id: "b".to_string(), candidate: cand(1), box_id: Some(2) }]
        );

        let effects = m
            .handle_backend_event(BackendEvent::Failed { key: key.clone(), reason: "ice failed".into() }, now)
            .await;
        assert_eq!(effects.events, vec![PeerEvent::Closed { key: key.clone(), reason: CloseReason::TransportFailed }]);

        // Candidates for closed links are not sent
        let effects = m
            .handle_backend_event(BackendEvent::LocalCandidate { key, candidate: cand(2) }, now)
            .await;
        assert!(effects.messages.is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_closes_link() {
        let now = Instant::now();
        let mut m = PeerSessionManager::new(
            FakeBackend { fail_open: true, ..Default::default() },
            Duration::from_secs(15),
        );
        m.set_local_id("a");
        let effects = m.connect_to_peers(2, &["b".to_string()], None, now).await;
        assert!(effects.messages.is_empty());
        assert_eq!(
            effects.events,
            vec![PeerEvent::Closed { key: LinkKey::new("b", 2), reason: CloseReason::TransportFailed }]
        );
    }
}
