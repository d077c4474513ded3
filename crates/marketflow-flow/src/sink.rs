//! The sink capability surface.
//!
//! Sinks are the engine's only exit: each registered sink gets a bounded
//! outbox and a dedicated serial worker, so one slow sink never stalls the
//! others.

use crate::error::FlowResult;
use async_trait::async_trait;
use marketflow_core::MarketData;

/// Health report for a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkHealth {
    pub healthy: bool,
    /// Most recent write latency, when known.
    pub latency_ms: Option<f64>,
}

impl SinkHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            latency_ms: None,
        }
    }
}

/// A delivery target for routed market data.
///
/// `write` receives batches in per-tuple submit order and must not reorder
/// within a batch. Returning `FlowError::SinkTransient` triggers the
/// engine's retry/backoff loop; `FlowError::SinkPermanent` skips straight
/// to the dead-letter path.
#[async_trait]
pub trait Sink: Send + Sync {
    fn id(&self) -> &str;

    async fn write(&self, batch: &[MarketData]) -> FlowResult<()>;

    fn health(&self) -> SinkHealth;

    async fn close(&self) -> FlowResult<()>;
}

/// Destination for batches that exhausted their retry budget.
pub trait DeadLetter: Send + Sync {
    fn dead_letter(&self, batch: Vec<MarketData>, reason: &str);
}
