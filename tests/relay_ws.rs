// End-to-end relay behavior over real WebSocket connections

use boxroom::auth::jwt::create_token;
use boxroom::config::ServerConfig;
use boxroom::db::AuditLog;
use boxroom::metrics::ServerMetrics;
use boxroom::room::{RoomRegistry, UserInfo};
use boxroom::signaling::SignalingServer;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration-secret";

async fn start_relay(config: ServerConfig) -> (String, oneshot::Sender<()>) {
    let metrics = ServerMetrics::new();
    let registry = Arc::new(RoomRegistry::new(config.default_max_boxes, AuditLog::disabled(), metrics.clone()));
    let server = SignalingServer::new(&config, registry, metrics);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.serve(listener, async move {
        let _ = rx.await;
    }));
    (format!("ws://{addr}/ws"), tx)
}

async fn send(ws: &mut Ws, msg: Value) {
    ws.send(Message::Text(msg.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Connects and consumes the welcome, returning the assigned connection id
async fn connect(url: &str) -> (Ws, String) {
    let (mut ws, _) = connect_async(url).await.unwrap();
    let welcome = recv(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    let id = welcome["connectionId"].as_str().unwrap().to_string();
    (ws, id)
}

async fn enter_room(ws: &mut Ws, room: &str) -> Value {
    send(ws, json!({ "type": "join-stream-room", "roomId": room, "maxParticipants": 4 })).await;
    let state = recv(ws).await;
    assert_eq!(state["type"], "room-state");
    state
}

fn join_box(room: &str, box_id: u8, user_id: &str) -> Value {
    json!({
        "type": "join-box",
        "roomId": room,
        "boxId": box_id,
        "user": { "id": user_id, "username": user_id },
    })
}

#[tokio::test]
async fn test_box_assignment_and_relay() {
    let (url, _shutdown) = start_relay(ServerConfig::default()).await;
    let (mut host, host_id) = connect(&url).await;
    let (mut guest, guest_id) = connect(&url).await;
    assert_ne!(host_id, guest_id);

    let state = enter_room(&mut host, "r1").await;
    assert_eq!(state["maxBoxes"], 4);
    assert_eq!(state["boxes"].as_array().unwrap().len(), 4);
    assert_eq!(state["boxes"][0]["role"], "host");
    enter_room(&mut guest, "r1").await;

    send(&mut host, join_box("r1", 1, "alice")).await;
    let accepted = recv(&mut host).await;
    assert_eq!(accepted["type"], "box-accepted");
    assert_eq!(accepted["participant"]["connectionId"], host_id.as_str());
    let joined = recv(&mut guest).await;
    assert_eq!(joined["type"], "box-joined");
    assert_eq!(joined["boxId"], 1);
    assert_eq!(joined["connectionId"], host_id.as_str());

    // Box 1 is taken
    send(&mut guest, join_box("r1", 1, "bob")).await;
    let rejected = recv(&mut guest).await;
    assert_eq!(rejected["type"], "rejected");
    assert_eq!(rejected["reason"], "box_taken");

    send(&mut guest, join_box("r1", 2, "bob")).await;
    assert_eq!(recv(&mut guest).await["type"], "box-accepted");
    let joined = recv(&mut host).await;
    assert_eq!(joined["boxId"], 2);

    send(&mut guest, json!({ "type": "request-peers-for-box", "boxId": 2, "roomId": "r1" })).await;
    let peers = recv(&mut guest).await;
    assert_eq!(peers["type"], "peers-for-box");
    assert_eq!(peers["connectionIds"], json!([host_id]));

    // The relay stamps the real sender
    send(
        &mut guest,
        json!({
            "type": "signal-offer",
            "toConnectionId": host_id,
            "fromConnectionId": "spoofed",
            "boxId": 2,
            "offer": { "type": "offer", "sdp": "v=0" },
        }),
    )
    .await;
    let offer = recv(&mut host).await;
    assert_eq!(offer["type"], "signal-offer");
    assert_eq!(offer["fromConnectionId"], guest_id.as_str());
    assert_eq!(offer["offer"]["sdp"], "v=0");

    // Disconnecting vacates the box for everyone else
    guest.close(None).await.unwrap();
    let left = recv(&mut host).await;
    assert_eq!(left["type"], "box-left");
    assert_eq!(left["boxId"], 2);
}

#[tokio::test]
async fn test_token_identity() {
    let config = ServerConfig {
        jwt_secret: Some(SECRET.to_string()),
        ..Default::default()
    };
    let (url, _shutdown) = start_relay(config).await;

    assert!(connect_async(format!("{url}?token=garbage")).await.is_err());

    let user = UserInfo {
        id: "u-42".to_string(),
        username: "carol".to_string(),
        avatar: None,
    };
    let token = create_token(&user, SECRET).unwrap();
    let (mut verified, _) = connect(&format!("{url}?token={token}")).await;
    let state = enter_room(&mut verified, "r2").await;
    assert!(state["hostUserId"].is_null());

    // The declared user is ignored in favor of the token
    send(&mut verified, join_box("r2", 1, "mallory")).await;
    let accepted = recv(&mut verified).await;
    assert_eq!(accepted["type"], "box-accepted");
    assert_eq!(accepted["participant"]["user"]["id"], "u-42");
    assert_eq!(accepted["participant"]["user"]["username"], "carol");

    // Anonymous connections may watch but not take a box
    let (mut anonymous, _) = connect(&url).await;
    let state = enter_room(&mut anonymous, "r2").await;
    assert_eq!(state["hostUserId"], "u-42");
    send(&mut anonymous, join_box("r2", 2, "dave")).await;
    assert_eq!(recv(&mut anonymous).await["type"], "error");
}

#[tokio::test]
async fn test_early_viewer_does_not_take_host_seat() {
    let config = ServerConfig {
        jwt_secret: Some(SECRET.to_string()),
        ..Default::default()
    };
    let (url, _shutdown) = start_relay(config).await;
    let token_for = |id: &str| {
        let user = UserInfo {
            id: id.to_string(),
            username: id.to_string(),
            avatar: None,
        };
        create_token(&user, SECRET).unwrap()
    };

    // The viewer's join-stream-room creates the room
    let (mut viewer, _) = connect(&format!("{url}?token={}", token_for("viewer"))).await;
    enter_room(&mut viewer, "r3").await;

    let (mut broadcaster, _) = connect(&format!("{url}?token={}", token_for("broadcaster"))).await;
    enter_room(&mut broadcaster, "r3").await;
    send(&mut broadcaster, join_box("r3", 1, "broadcaster")).await;
    assert_eq!(recv(&mut broadcaster).await["type"], "box-accepted");
    let joined = recv(&mut viewer).await;
    assert_eq!(joined["type"], "box-joined");
    assert_eq!(joined["user"]["id"], "broadcaster");

    // Once claimed, box 1 stays with the broadcaster
    send(&mut broadcaster, json!({ "type": "leave-box", "roomId": "r3", "boxId": 1 })).await;
    assert_eq!(recv(&mut viewer).await["type"], "box-left");
    send(&mut viewer, join_box("r3", 1, "viewer")).await;
    let rejected = recv(&mut viewer).await;
    assert_eq!(rejected["type"], "rejected");
    assert_eq!(rejected["reason"], "reserved_for_host");
}
