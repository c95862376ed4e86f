//! Error taxonomy.
//!
//! `StartupError` is fatal and occurs before the server accepts any traffic.
//! `OperationError` is recoverable and scoped to a single request or job.
//! Expected steady-state races (duplicate replicated messages, join-while-
//! present, leave-while-absent) are not errors at all; the channel state
//! machine drops them silently.

use thiserror::Error;

/// Unrecoverable failure during startup, before any traffic is served.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Recoverable per-request failure, reported to the client as a structured
/// error payload.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid parameter {name}: {detail}")]
    InvalidParameter { name: String, detail: String },

    #[error("user {0} is banned from this channel")]
    Banned(String),

    #[error("server is shutting down")]
    ShuttingDown,
}

impl OperationError {
    /// Short machine-readable code used in error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            OperationError::Auth(_) => "auth",
            OperationError::InvalidParameter { .. } => "invalid_parameter",
            OperationError::Banned(_) => "banned",
            OperationError::ShuttingDown => "shutting_down",
        }
    }
}
