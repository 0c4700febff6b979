#![forbid(unsafe_code)]

use anyhow::Result;
use boxroom::config::ServerConfig;
use boxroom::db::{self, AuditLog, PgAuditSink};
use boxroom::metrics::ServerMetrics;
use boxroom::room::RoomRegistry;
use boxroom::signaling::SignalingServer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxroom=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("boxroom - Starting server");

    let config = ServerConfig::from_env();
    let metrics = ServerMetrics::new();

    // Connect to database (optional)
    let audit = match db::connect(config.database_url.as_deref()).await? {
        Some(pool) => AuditLog::spawn(Arc::new(PgAuditSink::new(pool))),
        None => AuditLog::disabled(),
    };

    let registry = Arc::new(RoomRegistry::new(config.default_max_boxes, audit, metrics.clone()));

    // Reap rooms nobody watches or occupies
    let reaper_registry = registry.clone();
    let room_idle_timeout = config.room_idle_timeout;
    let reaper = tokio::spawn(async move {
        let period = (room_idle_timeout / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let reaped = reaper_registry.reap_idle(room_idle_timeout, Instant::now());
            if reaped > 0 {
                info!("Reaped {} idle room(s)", reaped);
            }
        }
    });

    let signaling_server = SignalingServer::new(&config, registry.clone(), metrics);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;

    // Run server with graceful shutdown
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
        }
    };
    if let Err(e) = signaling_server.serve(listener, shutdown).await {
        tracing::error!("Signaling server error: {}", e);
    }

    reaper.abort();
    registry.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
