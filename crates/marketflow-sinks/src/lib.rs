//! Channel sinks for the dataflow engine.
//!
//! Three delivery targets behind the one `Sink` trait:
//! - `PubSubSink`: publishes to a managed topic family via an injected
//!   provider
//! - `CacheSink`: bounded in-memory ring per `(exchange, symbol, type)`
//! - `ProxySink`: hands records to the browser fan-out proxy

pub mod cache;
pub mod proxy_sink;
pub mod pubsub;

pub use cache::{AgeStats, CacheConfig, CacheSink, CacheStats};
pub use proxy_sink::ProxySink;
pub use pubsub::{
    DefaultTopicStrategy, PubSubBatchSettings, PubSubMessage, PubSubSink, TopicPublisher,
    TopicStrategy,
};
