//! Browser-facing WebSocket fan-out proxy.
//!
//! Accepts browser connections on `/ws`, maintains per-client filter
//! subscriptions in a reverse index, and fans matching market data out to
//! bounded per-client outbound queues. One writer task per connection
//! serializes all writes; `forward_message` never suspends.

pub mod config;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod proxy;
pub mod server;

pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use filter::{ClientFilter, SubscriptionIndex};
pub use protocol::{ClientMessage, Envelope, FilterRequest};
pub use proxy::{ProxyStatsSnapshot, WebSocketProxy};
pub use server::{router, run_server, serve};

/// Close code sent when the proxy is at client capacity.
pub const CLOSE_CAPACITY: u16 = 1013;
/// Close code for clients whose outbound queue overflowed.
pub const CLOSE_SLOW_CONSUMER: u16 = 4000;
/// Close code for clients that stopped answering pings.
pub const CLOSE_HEARTBEAT_LOST: u16 = 4001;
