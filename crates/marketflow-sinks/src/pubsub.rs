//! Pub/Sub sink.
//!
//! Publishes each record to a topic derived from its classification. The
//! concrete provider is an external collaborator injected as a
//! `TopicPublisher`; an in-memory publisher backs the tests.

use async_trait::async_trait;
use marketflow_core::MarketData;
use marketflow_flow::{FlowError, FlowResult, Sink, SinkHealth};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Attribute value identifying this system as the publisher.
const SOURCE_ATTRIBUTE: &str = "exchange-collector";

/// One message handed to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    /// JSON-serialized `MarketData`.
    pub payload: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
    pub ordering_key: Option<String>,
}

/// Provider batching settings, passed through at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubBatchSettings {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
}

fn default_max_messages() -> usize {
    100
}

fn default_max_bytes() -> usize {
    1_000_000
}

fn default_max_latency_ms() -> u64 {
    50
}

impl Default for PubSubBatchSettings {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_bytes: default_max_bytes(),
            max_latency_ms: default_max_latency_ms(),
        }
    }
}

/// The concrete pub/sub provider seam.
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Publish a batch to one topic. Errors bubble back into the engine's
    /// retry loop.
    async fn publish(&self, topic: &str, messages: Vec<PubSubMessage>) -> FlowResult<()>;

    async fn shutdown(&self) -> FlowResult<()>;
}

/// Maps a record to its topic.
pub trait TopicStrategy: Send + Sync {
    fn topic_for(&self, data: &MarketData) -> String;
}

/// Default naming: `<prefix>-<bucket>-<exchange>` with every `kline_*`
/// collapsed into the `kline` bucket.
pub struct DefaultTopicStrategy {
    prefix: String,
}

impl DefaultTopicStrategy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl TopicStrategy for DefaultTopicStrategy {
    fn topic_for(&self, data: &MarketData) -> String {
        let type_name = data.data_type.as_str();
        let bucket = if type_name.starts_with("kline_") {
            "kline"
        } else {
            type_name.as_str()
        };
        format!("{}-{}-{}", self.prefix, bucket, data.exchange)
    }
}

/// Publishes routed records to the topic family.
pub struct PubSubSink {
    id: String,
    publisher: Arc<dyn TopicPublisher>,
    strategy: Box<dyn TopicStrategy>,
    ordering_enabled: bool,
    batch_settings: PubSubBatchSettings,
    last_write_latency_us: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl PubSubSink {
    pub fn new(
        id: impl Into<String>,
        publisher: Arc<dyn TopicPublisher>,
        strategy: Box<dyn TopicStrategy>,
        ordering_enabled: bool,
        batch_settings: PubSubBatchSettings,
    ) -> Self {
        Self {
            id: id.into(),
            publisher,
            strategy,
            ordering_enabled,
            batch_settings,
            last_write_latency_us: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn batch_settings(&self) -> &PubSubBatchSettings {
        &self.batch_settings
    }

    fn to_message(&self, data: &MarketData) -> FlowResult<PubSubMessage> {
        let payload = serde_json::to_vec(data)
            .map_err(|e| FlowError::SinkPermanent(format!("serialize failed: {e}")))?;
        let mut attributes = BTreeMap::new();
        attributes.insert("exchange".to_string(), data.exchange.clone());
        attributes.insert("symbol".to_string(), data.symbol.clone());
        attributes.insert("type".to_string(), data.data_type.as_str());
        attributes.insert("timestamp".to_string(), data.event_timestamp.to_string());
        attributes.insert("source".to_string(), SOURCE_ATTRIBUTE.to_string());
        let ordering_key = self
            .ordering_enabled
            .then(|| format!("{}:{}", data.exchange, data.symbol));
        Ok(PubSubMessage {
            payload,
            attributes,
            ordering_key,
        })
    }
}

#[async_trait]
impl Sink for PubSubSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, batch: &[MarketData]) -> FlowResult<()> {
        // Group by topic, preserving in-batch order within each group.
        let mut by_topic: BTreeMap<String, Vec<PubSubMessage>> = BTreeMap::new();
        for data in batch {
            let topic = self.strategy.topic_for(data);
            by_topic.entry(topic).or_default().push(self.to_message(data)?);
        }

        let started = Instant::now();
        for (topic, messages) in by_topic {
            let count = messages.len();
            if let Err(e) = self.publisher.publish(&topic, messages).await {
                *self.last_error.lock() = Some(e.to_string());
                return Err(e);
            }
            debug!(sink = %self.id, %topic, count, "Published");
        }
        self.last_write_latency_us
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        *self.last_error.lock() = None;
        Ok(())
    }

    fn health(&self) -> SinkHealth {
        SinkHealth {
            healthy: self.last_error.lock().is_none(),
            latency_ms: Some(self.last_write_latency_us.load(Ordering::Relaxed) as f64 / 1000.0),
        }
    }

    async fn close(&self) -> FlowResult<()> {
        self.publisher.shutdown().await
    }
}
