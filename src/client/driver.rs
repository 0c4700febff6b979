#![forbid(unsafe_code)]

// Client driver - pumps relay messages, backend callbacks, user intents and
// housekeeping ticks through a room session, reconnecting when the relay
// connection drops

use super::media::MediaDevices;
use super::peer::{BackendEvent, MediaBackend};
use super::session::RoomSession;
use super::transport::SignalingClient;
use super::view::RoomView;
use super::{ClientConfig, ClientError};
use crate::signaling::protocol::{ClientMessage, ServerMessage};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// What the local user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Join(u8),
    Leave(u8),
    Exit,
}

enum Outcome {
    Exited,
    RoomClosed,
    /// The relay went away; `welcomed` is false if it never greeted us
    Lost { welcomed: bool },
}

fn publish(view_tx: &watch::Sender<RoomView>, view: &RoomView) {
    view_tx.send_if_modified(|current| {
        if current != view {
            *current = view.clone();
            true
        } else {
            false
        }
    });
}

/// Runs a room visit until the user exits, the host ends the room, or the
/// relay stays unreachable for every reconnect attempt. The attempt count
/// only resets once a connection has been welcomed by the relay.
///
/// # Errors
/// Returns the last transport error once reconnect attempts are exhausted
pub async fn run<B, D>(
    config: ClientConfig,
    mut session: RoomSession<B, D>,
    mut backend_events: mpsc::Receiver<BackendEvent>,
    mut intents: mpsc::Receiver<Intent>,
    view_tx: watch::Sender<RoomView>,
) -> Result<(), ClientError>
where
    B: MediaBackend,
    D: MediaDevices,
{
    let url = config.connect_url();
    let mut attempt: u32 = 0;

    loop {
        let mut client = match SignalingClient::connect(&url, config.keepalive_interval).await {
            Ok(client) => client,
            Err(e) => {
                attempt += 1;
                if attempt > config.reconnect_attempts {
                    warn!("Giving up on relay after {} attempts: {}", config.reconnect_attempts, e);
                    return Err(e);
                }
                warn!("Relay connection failed (attempt {}): {}", attempt, e);
                tokio::time::sleep(config.reconnect_delay * attempt).await;
                continue;
            }
        };
        info!("Connected to relay for room {}", session.room_id());

        let outcome = drive(&config, &mut session, &mut client, &mut backend_events, &mut intents, &view_tx).await;
        match outcome {
            Outcome::Exited | Outcome::RoomClosed => {
                client.close().await;
                publish(&view_tx, session.view());
                return Ok(());
            }
            Outcome::Lost { welcomed } => {
                session.on_transport_lost(Instant::now()).await;
                publish(&view_tx, session.view());
                if welcomed {
                    attempt = 0;
                }
                attempt += 1;
                if attempt > config.reconnect_attempts {
                    return Err(ClientError::Transport("relay connection lost".to_string()));
                }
                tokio::time::sleep(config.reconnect_delay * attempt).await;
            }
        }
    }
}

async fn drive<B, D>(
    config: &ClientConfig,
    session: &mut RoomSession<B, D>,
    client: &mut SignalingClient,
    backend_events: &mut mpsc::Receiver<BackendEvent>,
    intents: &mut mpsc::Receiver<Intent>,
    view_tx: &watch::Sender<RoomView>,
) -> Outcome
where
    B: MediaBackend,
    D: MediaDevices,
{
    let mut ticker = tokio::time::interval(config.tick_interval);
    let mut welcomed = false;

    loop {
        let outgoing: Vec<ClientMessage> = tokio::select! {
            msg = client.recv() => match msg {
                Some(msg) => {
                    welcomed |= matches!(msg, ServerMessage::Welcome { .. });
                    session.handle(msg, Instant::now()).await
                }
                None => return Outcome::Lost { welcomed },
            },
            Some(event) = backend_events.recv() => {
                session.handle_backend_event(event, Instant::now()).await
            }
            intent = intents.recv() => match intent.unwrap_or(Intent::Exit) {
                Intent::Join(box_id) => match session.request_join(box_id, Instant::now()).await {
                    Ok(out) => out,
                    Err(e) => {
                        warn!("Join of box {} refused locally: {}", box_id, e);
                        Vec::new()
                    }
                },
                Intent::Leave(box_id) => match session.request_leave(box_id, Instant::now()).await {
                    Ok(out) => out,
                    Err(e) => {
                        warn!("Leave of box {} refused locally: {}", box_id, e);
                        Vec::new()
                    }
                },
                Intent::Exit => {
                    let out = session.exit(Instant::now()).await;
                    if let Err(e) = client.send_all(out).await {
                        warn!("Could not notify relay of exit: {}", e);
                    }
                    return Outcome::Exited;
                }
            },
            _ = ticker.tick() => session.tick(Instant::now()).await,
        };

        if let Err(e) = client.send_all(outgoing).await {
            warn!("Relay send failed: {}", e);
            return Outcome::Lost { welcomed };
        }
        publish(view_tx, session.view());
        if session.is_closed() {
            return Outcome::RoomClosed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::media::testing::FakeDevices;
    use crate::client::peer::testing::FakeBackend;
    use crate::config::ServerConfig;
    use crate::db::AuditLog;
    use crate::metrics::ServerMetrics;
    use crate::room::{RoomRegistry, UserInfo};
    use crate::signaling::SignalingServer;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn start_relay(config: ServerConfig) -> (String, Arc<RoomRegistry>, oneshot::Sender<()>) {
        let metrics = ServerMetrics::new();
        let registry = Arc::new(RoomRegistry::new(config.default_max_boxes, AuditLog::disabled(), metrics.clone()));
        let server = SignalingServer::new(&config, registry.clone(), metrics);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(server.serve(listener, async move {
            let _ = rx.await;
        }));
        (format!("ws://{addr}/ws"), registry, tx)
    }

    fn user(id: &str, username: &str) -> UserInfo {
        UserInfo {
            id: id.to_string(),
            username: username.to_string(),
            avatar: None,
        }
    }

    async fn wait_for(view_rx: &mut watch::Receiver<RoomView>, pred: impl Fn(&RoomView) -> bool) -> RoomView {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(&view_rx.borrow_and_update()) {
                    return view_rx.borrow().clone();
                }
                view_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_join_then_exit_against_live_relay() {
        let (url, _registry, _shutdown) = start_relay(ServerConfig::default()).await;
        let config = ClientConfig {
            server_url: url,
            ..Default::default()
        };
        let devices = FakeDevices::default();
        let session = RoomSession::new(
            "live",
            Some(4),
            Some(user("u1", "alice")),
            FakeBackend::default(),
            devices.clone(),
            &config,
        );

        let (_backend_tx, backend_rx) = mpsc::channel(8);
        let (intent_tx, intent_rx) = mpsc::channel(8);
        let (view_tx, mut view_rx) = watch::channel(RoomView::default());
        let handle = tokio::spawn(run(config, session, backend_rx, intent_rx, view_tx));

        wait_for(&mut view_rx, |v| v.connected && v.boxes.len() == 4).await;
        intent_tx.send(Intent::Join(1)).await.unwrap();
        let view = wait_for(&mut view_rx, |v| v.local_box == Some(1)).await;
        assert_eq!(view.box_view(1).unwrap().occupant.as_ref().unwrap().user.username, "alice");
        assert_eq!(devices.live(), 1);

        intent_tx.send(Intent::Exit).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(devices.live(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_relay_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig {
            server_url: format!("ws://{addr}/ws"),
            reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let session = RoomSession::new("r", None, None, FakeBackend::default(), FakeDevices::default(), &config);
        let (_backend_tx, backend_rx) = mpsc::channel(8);
        let (_intent_tx, intent_rx) = mpsc::channel(8);
        let (view_tx, _view_rx) = watch::channel(RoomView::default());

        let result = run(config, session, backend_rx, intent_rx, view_tx).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn test_quiet_occupant_survives_relay_idle_timeout() {
        let server_config = ServerConfig {
            idle_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let (url, registry, _shutdown) = start_relay(server_config).await;
        let config = ClientConfig {
            server_url: url,
            keepalive_interval: Duration::from_millis(200),
            ..Default::default()
        };
        let session = RoomSession::new(
            "quiet",
            Some(4),
            Some(user("u2", "bob")),
            FakeBackend::default(),
            FakeDevices::default(),
            &config,
        );
        let (_backend_tx, backend_rx) = mpsc::channel(8);
        let (intent_tx, intent_rx) = mpsc::channel(8);
        let (view_tx, mut view_rx) = watch::channel(RoomView::default());
        let _handle = tokio::spawn(run(config, session, backend_rx, intent_rx, view_tx));

        wait_for(&mut view_rx, |v| v.connected && v.boxes.len() == 4).await;
        intent_tx.send(Intent::Join(2)).await.unwrap();
        wait_for(&mut view_rx, |v| v.local_box == Some(2)).await;

        // No application traffic for well past the relay's idle timeout
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let state = registry.snapshot("quiet").await.unwrap();
        assert_eq!(state.occupant(2).unwrap().user.id, "u2");
        assert!(view_rx.borrow().connected);
    }

    #[tokio::test]
    async fn test_relay_that_never_welcomes_exhausts_attempts() {
        // Accepts the WebSocket upgrade, then hangs up before any message
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    drop(ws);
                }
            }
        });

        let config = ClientConfig {
            server_url: format!("ws://{addr}/ws"),
            reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let session = RoomSession::new("r", None, None, FakeBackend::default(), FakeDevices::default(), &config);
        let (_backend_tx, backend_rx) = mpsc::channel(8);
        let (_intent_tx, intent_rx) = mpsc::channel(8);
        let (view_tx, _view_rx) = watch::channel(RoomView::default());

        let result = tokio::time::timeout(Duration::from_secs(5), run(config, session, backend_rx, intent_rx, view_tx))
            .await
            .unwrap();
        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
