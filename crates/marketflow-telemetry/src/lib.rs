//! Prometheus metrics and structured logging for marketflow.
//!
//! Provides observability for:
//! - Exchange connection state and heartbeat health
//! - Feed parsing and validation
//! - DataFlow engine throughput, backpressure and sink delivery
//! - WebSocket proxy fan-out

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
