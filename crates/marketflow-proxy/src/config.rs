//! Proxy configuration.

use serde::{Deserialize, Serialize};

/// WebSocket proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Enable the proxy server.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent browser clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Server ping cadence in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Inactivity deadline in milliseconds, reset on any client frame.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Per-client outbound queue depth.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    8081
}

fn default_max_clients() -> usize {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

fn default_outbound_queue() -> usize {
    256
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_port(),
            max_clients: default_max_clients(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            outbound_queue: default_outbound_queue(),
        }
    }
}
