//! Error types for the subscription session.

use crate::types::ChannelKey;
use std::time::Duration;
use thiserror::Error;

/// Main error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Server rejected {key}: {reason}")]
    Protocol { key: ChannelKey, reason: String },

    #[error("Timed out after {0:?} waiting for confirmation")]
    Timeout(Duration),

    #[error("Subscription to {0} was cancelled before confirmation")]
    Cancelled(ChannelKey),

    #[error("Session is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::InvalidConfig(e.to_string())
    }
}

/// Error returned by a connection that could not enqueue a command.
///
/// The session logs it and leaves the affected keys for the next
/// reconciliation; it never reaches application calls.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
