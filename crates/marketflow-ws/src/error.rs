//! WebSocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Heartbeat lost")]
    HeartbeatLost,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid stream name: {0}")]
    InvalidStreamName(String),

    #[error("Too many streams: {count} exceeds limit {max}")]
    TooManyStreams { count: usize, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type WsResult<T> = Result<T, WsError>;
