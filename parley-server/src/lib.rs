//! Long-poll chat and presence server with inter-server replication.
//!
//! Clients talk HTTP (`/say`, `/wait`, `/poll`, ...); servers in a cluster
//! replicate messages to each other over persistent TCP links. All channel
//! state lives in memory and expires on its own.

pub mod auth;
pub mod channel;
pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod message;
pub mod replication;
pub mod server;
pub mod stats;

/// Milliseconds since the Unix epoch. All times in the system use this
/// scale, including message times and ban expiries.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
