//! Bounded, backpressure-aware dataflow engine.
//!
//! One `DataFlowEngine` pulls records from a bounded ingress queue, runs
//! them through a transformer chain, routes them by rule priority and fans
//! them out into per-sink bounded outboxes drained by serial sink workers.
//! Per `(exchange, symbol, type)` tuple, delivery order to any single sink
//! matches submit order; nothing on the hot path is unbounded.

pub mod engine;
pub mod error;
pub mod outbox;
pub mod router;
pub mod sink;
pub mod transformer;

pub use engine::{
    BackpressurePolicy, DataFlowEngine, EnqueueResult, FlowConfig, FlowHandle, FlowSnapshot,
    FlowStats, RejectReason, SinkOptions, SinkSnapshot,
};
pub use error::{FlowError, FlowResult};
pub use outbox::OutboxPolicy;
pub use router::{RouteMatcher, RouteRule, Router};
pub use sink::{DeadLetter, Sink, SinkHealth};
pub use transformer::{MinQualityFilter, TagTransformer, Transformer};
