//! Proxy error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Client capacity exceeded")]
    CapacityExceeded,

    #[error("Slow consumer: outbound queue overflowed")]
    SlowConsumer,

    #[error("Heartbeat lost: no pong within interval")]
    HeartbeatLost,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// Close code and reason sent to the client, for the variants that
    /// terminate a connection.
    pub fn close_frame(&self) -> Option<(u16, &'static str)> {
        match self {
            Self::CapacityExceeded => Some((crate::CLOSE_CAPACITY, "capacity")),
            Self::SlowConsumer => Some((crate::CLOSE_SLOW_CONSUMER, "slow_consumer")),
            Self::HeartbeatLost => Some((crate::CLOSE_HEARTBEAT_LOST, "heartbeat_lost")),
            _ => None,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_mapping() {
        assert_eq!(
            ProxyError::CapacityExceeded.close_frame(),
            Some((1013, "capacity"))
        );
        assert_eq!(
            ProxyError::SlowConsumer.close_frame(),
            Some((4000, "slow_consumer"))
        );
        assert_eq!(
            ProxyError::HeartbeatLost.close_frame(),
            Some((4001, "heartbeat_lost"))
        );
        assert!(ProxyError::Protocol("bad".to_string()).close_frame().is_none());
    }
}
