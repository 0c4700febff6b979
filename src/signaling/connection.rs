#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use super::relay::ConnectionDirectory;
use crate::metrics::ServerMetrics;
use crate::room::{Outbound, Participant, Rejection, RoomRegistry, UserInfo};
use crate::turn::TurnConfig;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale, drop them early.
pub(crate) const CHANNEL_CAPACITY: usize = 64;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_CONNECTION_ID_LEN: usize = 64;
const MAX_USER_ID_LEN: usize = 128;
const MAX_USERNAME_LEN: usize = 64;
const MAX_AVATAR_LEN: usize = 2048;
/// Rooms a single connection may watch at once
const MAX_ROOMS_PER_CONNECTION: usize = 16;

/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;

/// Token bucket rate limiter. Burst capacity equals the refill rate.
pub struct RateLimiter {
    tokens_us: u64,
    max_tokens_us: u64,
    refill_per_sec: u64,
    last_refill: Instant,
    warned: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over the limit. `first` is set on the first drop of a burst.
    Limited { first: bool },
}

impl RateLimiter {
    pub fn new(per_sec: u64, now: Instant) -> Self {
        let max_tokens_us = per_sec * TOKEN_US;
        Self {
            tokens_us: max_tokens_us,
            max_tokens_us,
            refill_per_sec: per_sec,
            last_refill: now,
            warned: false,
        }
    }

    pub fn check(&mut self, now: Instant) -> RateDecision {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        // refill_per_sec tokens per second = that many token-microseconds per microsecond
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(self.refill_per_sec))
            .min(self.max_tokens_us);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            RateDecision::Allowed
        } else {
            let first = !self.warned;
            self.warned = true;
            RateDecision::Limited { first }
        }
    }
}

/// Shared handles every connection handler needs
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<RoomRegistry>,
    pub directory: ConnectionDirectory,
    pub turn_config: Option<Arc<TurnConfig>>,
    pub metrics: ServerMetrics,
    pub idle_timeout: Duration,
    pub rate_limit_per_sec: u64,
    /// Set when tokens are verified; declared identities are then ignored
    pub verification_enabled: bool,
}

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(sender: &Outbound, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    ctx: ConnectionContext,
    identity: Option<UserInfo>,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!(
        "New WebSocket connection: {} ({})",
        connection_id,
        identity.as_ref().map_or("anonymous", |u| u.username.as_str())
    );

    ctx.metrics.inc_connections_total();
    let _conn_guard = ctx.metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let connection_id_clone = connection_id.clone();
    let send_metrics = ctx.metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", connection_id_clone);
    });

    ctx.directory.register(&connection_id, tx.clone());

    let ice_servers = ctx
        .turn_config
        .as_ref()
        .map(|tc| vec![tc.generate_credentials(&connection_id)])
        .unwrap_or_default();
    let _ = send_json(&tx, &ServerMessage::Welcome {
        connection_id: connection_id.clone(),
        ice_servers,
    });

    let mut session = ConnectionSession::new(connection_id.clone(), identity, tx.clone(), ctx.clone());
    let mut limiter = RateLimiter::new(ctx.rate_limit_per_sec, Instant::now());

    loop {
        // Idle timeout: close connection if no message within the configured window
        let msg = match tokio::time::timeout(ctx.idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                ctx.metrics.inc_messages_received();

                match limiter.check(Instant::now()) {
                    RateDecision::Allowed => {}
                    RateDecision::Limited { first } => {
                        if first {
                            warn!("Rate limit exceeded for connection {}", connection_id);
                            let _ = send_json(&tx, &ServerMessage::Error {
                                message: format!(
                                    "Rate limit exceeded: max {} messages/second",
                                    ctx.rate_limit_per_sec
                                ),
                            });
                        }
                        continue;
                    }
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let start = Instant::now();
                        let result = session.handle(client_msg).await;
                        ctx.metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling message from {}: {}", connection_id, e);
                            ctx.metrics.inc_errors();
                            // If channel is closed, send task has exited
                            if tx.is_closed() {
                                break;
                            }
                            let _ = send_json(&tx, &ServerMessage::Error {
                                message: format!("Error: {e}"),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format: {}", e);
                        ctx.metrics.inc_errors();
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", connection_id);
            }
        }
    }

    session.close().await;

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for connection: {}", connection_id);
}

/// Per-connection protocol state
pub(crate) struct ConnectionSession {
    connection_id: String,
    /// Verified identity from the upgrade token
    identity: Option<UserInfo>,
    sender: Outbound,
    subscriptions: HashSet<String>,
    ctx: ConnectionContext,
}

impl ConnectionSession {
    pub(crate) fn new(
        connection_id: String,
        identity: Option<UserInfo>,
        sender: Outbound,
        ctx: ConnectionContext,
    ) -> Self {
        Self {
            connection_id,
            identity,
            sender,
            subscriptions: HashSet::new(),
            ctx,
        }
    }

    fn reject(&self, message: &ClientMessage, room_id: Option<&str>, box_id: Option<u8>, reason: Rejection) -> anyhow::Result<()> {
        debug!(
            "Rejected {} from {} (room {:?}, box {:?}): {:?}",
            message.name(), self.connection_id, room_id, box_id, reason
        );
        send_json(&self.sender, &ServerMessage::Rejected {
            op: message.name().to_string(),
            room_id: room_id.map(String::from),
            box_id,
            reason,
        })
    }

    /// Identity a box join acts as
    fn joining_user(&self, declared: Option<&UserInfo>) -> anyhow::Result<UserInfo> {
        if self.ctx.verification_enabled {
            return match &self.identity {
                Some(user) => Ok(user.clone()),
                None => anyhow::bail!("Joining a box requires an authenticated connection"),
            };
        }
        let Some(user) = declared else {
            anyhow::bail!("join-box requires a user");
        };
        if user.id.is_empty() || user.id.len() > MAX_USER_ID_LEN {
            anyhow::bail!("Invalid user id: must be 1-{MAX_USER_ID_LEN} characters");
        }
        if user.username.is_empty() || user.username.len() > MAX_USERNAME_LEN {
            anyhow::bail!("Invalid username: must be 1-{MAX_USERNAME_LEN} characters");
        }
        if user.avatar.as_ref().is_some_and(|a| a.len() > MAX_AVATAR_LEN) {
            anyhow::bail!("Invalid avatar: longer than {MAX_AVATAR_LEN} characters");
        }
        debug!("Connection {} acting as unverified user {}", self.connection_id, user.id);
        Ok(user.clone())
    }

    fn relay(&self, to_connection_id: &str, message: ServerMessage) -> anyhow::Result<()> {
        if to_connection_id.is_empty() || to_connection_id.len() > MAX_CONNECTION_ID_LEN {
            anyhow::bail!("Invalid toConnectionId");
        }
        if self.ctx.directory.unicast(to_connection_id, &message) {
            self.ctx.metrics.inc_signals_relayed();
        } else {
            self.ctx.metrics.inc_signals_dropped();
        }
        Ok(())
    }

    /// Handle a single client message
    pub(crate) async fn handle(&mut self, message: ClientMessage) -> anyhow::Result<()> {
        let registry = self.ctx.registry.clone();
        match &message {
            ClientMessage::JoinStreamRoom { room_id, max_participants } => {
                check_room_id(room_id)?;
                if !self.subscriptions.contains(room_id)
                    && self.subscriptions.len() >= MAX_ROOMS_PER_CONNECTION
                {
                    anyhow::bail!("Too many rooms: max {MAX_ROOMS_PER_CONNECTION} per connection");
                }
                if let Err(reason) = registry.open_room(room_id, *max_participants) {
                    return self.reject(&message, Some(room_id), None, reason);
                }
                match registry.subscribe(room_id, &self.connection_id, self.sender.clone()).await {
                    Ok(_) => {
                        self.subscriptions.insert(room_id.clone());
                    }
                    Err(reason) => return self.reject(&message, Some(room_id), None, reason),
                }
            }

            ClientMessage::LeaveStreamRoom { room_id } => {
                if self.subscriptions.remove(room_id) {
                    registry.unsubscribe(room_id, &self.connection_id).await;
                }
            }

            ClientMessage::JoinBox { room_id, box_id, user } => {
                check_room_id(room_id)?;
                let user = self.joining_user(user.as_ref())?;
                let participant = Participant::new(self.connection_id.clone(), user);
                match registry.join_box(room_id, *box_id, participant.clone()).await {
                    Ok(()) => send_json(&self.sender, &ServerMessage::BoxAccepted {
                        room_id: room_id.clone(),
                        box_id: *box_id,
                        participant,
                    })?,
                    Err(reason) => self.reject(&message, Some(room_id), Some(*box_id), reason)?,
                }
            }

            ClientMessage::LeaveBox { room_id, box_id } => {
                check_room_id(room_id)?;
                if let Err(reason) = registry.leave_box(room_id, *box_id, &self.connection_id).await {
                    self.reject(&message, Some(room_id), Some(*box_id), reason)?;
                }
            }

            ClientMessage::RequestPeersForBox { box_id, room_id } => {
                if let Some(room_id) = room_id {
                    check_room_id(room_id)?;
                }
                match registry.peers_for_box(room_id.as_deref(), *box_id, &self.connection_id).await {
                    Ok(connection_ids) => send_json(&self.sender, &ServerMessage::PeersForBox {
                        box_id: *box_id,
                        connection_ids,
                    })?,
                    Err(reason) => self.reject(&message, room_id.as_deref(), Some(*box_id), reason)?,
                }
            }

            ClientMessage::SignalOffer { to_connection_id, from_connection_id, box_id, offer } => {
                if from_connection_id != &self.connection_id {
                    debug!("Overwriting spoofed sender {} with {}", from_connection_id, self.connection_id);
                }
                self.relay(to_connection_id, ServerMessage::SignalOffer {
                    to_connection_id: to_connection_id.clone(),
                    from_connection_id: self.connection_id.clone(),
                    box_id: *box_id,
                    offer: offer.clone(),
                })?;
            }

            ClientMessage::SignalAnswer { to_connection_id, from_connection_id, box_id, answer } => {
                if from_connection_id != &self.connection_id {
                    debug!("Overwriting spoofed sender {} with {}", from_connection_id, self.connection_id);
                }
                self.relay(to_connection_id, ServerMessage::SignalAnswer {
                    to_connection_id: to_connection_id.clone(),
                    from_connection_id: self.connection_id.clone(),
                    box_id: *box_id,
                    answer: answer.clone(),
                })?;
            }

            ClientMessage::SignalIce { to_connection_id, candidate, box_id } => {
                self.relay(to_connection_id, ServerMessage::SignalIce {
                    to_connection_id: to_connection_id.clone(),
                    from_connection_id: self.connection_id.clone(),
                    candidate: candidate.clone(),
                    box_id: *box_id,
                })?;
            }

            ClientMessage::EndStream { room_id } => {
                check_room_id(room_id)?;
                match registry.end_room(room_id, &self.connection_id).await {
                    Ok(()) => {
                        self.subscriptions.remove(room_id);
                    }
                    Err(reason) => self.reject(&message, Some(room_id), None, reason)?,
                }
            }
        }

        Ok(())
    }

    /// Releases everything the connection held
    pub(crate) async fn close(&mut self) {
        self.ctx.directory.unregister(&self.connection_id);
        let vacated = self.ctx.registry.drop_connection(&self.connection_id).await;
        if !vacated.is_empty() {
            info!("Connection {} released {} box(es) on disconnect", self.connection_id, vacated.len());
        }
        self.subscriptions.clear();
    }
}

fn check_room_id(room_id: &str) -> anyhow::Result<()> {
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
        anyhow::bail!("Invalid roomId: must be 1-{MAX_ROOM_ID_LEN} characters");
    }
    Ok(())
}
