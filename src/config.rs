#![forbid(unsafe_code)]

// Server configuration read from environment variables

use crate::room::{validate_layout, ALLOWED_BOX_COUNTS};
use crate::turn::TurnConfig;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_MAX_BOXES: u8 = 4;
const DEFAULT_ROOM_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RATE_LIMIT_PER_SEC: u64 = 100;
const DEFAULT_TURN_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    /// Box count for rooms opened without an explicit layout
    pub default_max_boxes: u8,
    /// How long an empty, unwatched room lives before it is reaped
    pub room_idle_timeout: Duration,
    /// Connection closed when nothing is received for this long
    pub idle_timeout: Duration,
    pub rate_limit_per_sec: u64,
    /// Enables verified identities on `/ws?token=`
    pub jwt_secret: Option<String>,
    /// Enables the box-join audit trail
    pub database_url: Option<String>,
    pub turn: Option<TurnConfig>,
    /// Bearer token guarding `/metrics`
    pub metrics_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            default_max_boxes: DEFAULT_MAX_BOXES,
            room_idle_timeout: Duration::from_secs(DEFAULT_ROOM_IDLE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            rate_limit_per_sec: DEFAULT_RATE_LIMIT_PER_SEC,
            jwt_secret: None,
            database_url: None,
            turn: None,
            metrics_token: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Malformed values fall back to
    /// their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut max_connections = parse_or(&var, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let mut default_max_boxes = parse_or(&var, "DEFAULT_MAX_BOXES", DEFAULT_MAX_BOXES);
        if validate_layout(default_max_boxes).is_err() {
            warn!(
                "DEFAULT_MAX_BOXES={} is not one of {:?}, using {}",
                default_max_boxes, ALLOWED_BOX_COUNTS, DEFAULT_MAX_BOXES
            );
            default_max_boxes = DEFAULT_MAX_BOXES;
        }

        let mut rate_limit_per_sec = parse_or(&var, "RATE_LIMIT_PER_SEC", DEFAULT_RATE_LIMIT_PER_SEC);
        if rate_limit_per_sec == 0 {
            warn!("RATE_LIMIT_PER_SEC=0 would drop every message, using default {}", DEFAULT_RATE_LIMIT_PER_SEC);
            rate_limit_per_sec = DEFAULT_RATE_LIMIT_PER_SEC;
        }

        let jwt_secret = var("JWT_SECRET");
        if jwt_secret.is_some() {
            info!("JWT verification enabled");
        } else {
            info!("JWT_SECRET not set, client-declared identities will be trusted");
        }

        let turn = TurnConfig::new(
            var("TURN_URLS").as_deref(),
            var("TURN_SECRET").as_deref(),
            parse_or(&var, "TURN_TTL", DEFAULT_TURN_TTL_SECS),
        );
        if turn.is_none() && (var("TURN_URLS").is_some() || var("TURN_SECRET").is_some()) {
            warn!("TURN needs both TURN_URLS and TURN_SECRET, TURN disabled");
        }

        Self {
            port: parse_or(&var, "PORT", DEFAULT_PORT),
            max_connections,
            default_max_boxes,
            room_idle_timeout: Duration::from_secs(parse_or(
                &var,
                "ROOM_IDLE_TIMEOUT_SECS",
                DEFAULT_ROOM_IDLE_TIMEOUT_SECS,
            )),
            idle_timeout: Duration::from_secs(parse_or(&var, "IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS)),
            rate_limit_per_sec,
            jwt_secret,
            database_url: var("DATABASE_URL"),
            turn,
            metrics_token: var("METRICS_TOKEN"),
        }
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring malformed {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}
