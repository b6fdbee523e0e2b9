//! Failures inside the connection hub. None of these take the hub down; each
//! is handled where it occurs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// A frame that does not decode as an envelope. The frame is dropped.
    #[error("malformed frame: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The session's mailbox is full; the session is closed.
    #[error("mailbox full for connection {0}")]
    Capacity(String),

    /// The session is already closing or closed.
    #[error("connection {0} is closed")]
    Closed(String),

    /// Socket read/write failure or deadline expiry.
    #[error("transport: {0}")]
    Transport(String),

    /// Relay bus publish/subscribe failure.
    #[error("relay bus: {0}")]
    Relay(String),

    /// The hub control loop has stopped.
    #[error("hub is not running")]
    HubUnavailable,
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::Relay(err.to_string())
    }
}

impl From<axum::Error> for GatewayError {
    fn from(err: axum::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
