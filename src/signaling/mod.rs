#![forbid(unsafe_code)]

// Signaling module - WebSocket relay for box membership and peer negotiation

pub mod connection;
pub mod protocol;
pub mod relay;

use crate::auth::{IdentityVerifier, JwtVerifier};
use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use connection::ConnectionContext;
use relay::ConnectionDirectory;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Largest accepted WebSocket frame
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    ctx: ConnectionContext,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    connection_semaphore: Arc<Semaphore>,
    metrics_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(config: &ServerConfig, registry: Arc<RoomRegistry>, metrics: ServerMetrics) -> Self {
        info!("Max connections: {}", config.max_connections);
        let verifier = config
            .jwt_secret
            .as_deref()
            .map(|secret| Arc::new(JwtVerifier::new(secret)) as Arc<dyn IdentityVerifier>);
        if let Some(turn) = &config.turn {
            info!("TURN enabled: {:?}", turn.urls);
        }

        Self {
            ctx: ConnectionContext {
                registry,
                directory: ConnectionDirectory::new(),
                turn_config: config.turn.clone().map(Arc::new),
                metrics,
                idle_timeout: config.idle_timeout,
                rate_limit_per_sec: config.rate_limit_per_sec,
                verification_enabled: verifier.is_some(),
            },
            verifier,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            metrics_token: config.metrics_token.clone(),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Serves on an already bound listener until `shutdown` resolves
    ///
    /// # Errors
    /// Returns an error if the server loop fails
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        info!("Starting signaling server on {}", listener.local_addr()?);
        let app = self.router();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.ctx.registry.room_count(),
        "occupiedBoxes": server.ctx.registry.occupied_box_count(),
        "connections": server.ctx.metrics.connections_active(),
    }))
}

/// Metrics handler: Prometheus text exposition format.
/// Protected by the optional METRICS_TOKEN (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let body = server.ctx.metrics.render_prometheus(
        server.ctx.registry.room_count(),
        server.ctx.registry.occupied_box_count(),
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(server): State<SignalingServer>,
) -> Response {
    let identity = match (&server.verifier, params.token.as_deref()) {
        (Some(verifier), Some(token)) => match verifier.verify(token) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Rejecting WebSocket upgrade: {}", e);
                return e.into_response();
            }
        },
        (Some(_), None) => {
            debug!("Anonymous connection: may watch rooms but not join boxes");
            None
        }
        (None, _) => None,
    };

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server.ctx, identity, permit))
}
