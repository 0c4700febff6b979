#![forbid(unsafe_code)]

// boxroom - multi-host broadcast rooms: box registry, signaling relay and
// the client-side room session that drives peer connections

pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod turn;
