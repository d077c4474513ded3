//! Exchange WebSocket connectivity for marketflow.
//!
//! Provides robust exchange-side WebSocket handling:
//! - Heartbeat compliance (server-driven ping/pong, health scoring)
//! - Reconnection policy with exponential backoff and uniform jitter
//! - A single-owner connection loop with typed event and command channels
//! - Binance combined-stream naming, URL building and subscription state

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod reconnect;
pub mod stream_name;
pub mod subscription;

pub use connection::{
    ConnectionCommand, ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionInfo,
    ConnectionManager, ConnectionState,
};
pub use error::{WsError, WsResult};
pub use heartbeat::{HeartbeatConfig, HeartbeatController, HeartbeatStats};
pub use reconnect::{DisconnectKind, ReconnectConfig, ReconnectDecision, ReconnectStrategy};
pub use stream_name::{
    build_combined_stream_url, build_stream_name, is_valid_stream_name, parse_stream_name,
    stream_stats, CombinedUrlOptions, StreamKind, StreamStats, UrlEncoding,
};
pub use subscription::{Subscription, SubscriptionManager, SubscriptionStatus};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
