//! Collector configuration.
//!
//! One TOML file covers adapters, engine tunables, sinks, routing rules
//! and proxy limits. Unknown keys are rejected at load time so typos never
//! reach the pipeline.

use crate::error::{AppError, AppResult};
use marketflow_adapter::{AdapterConfig, SubscriptionSpec};
use marketflow_flow::{BackpressurePolicy, FlowConfig, RouteMatcher, RouteRule};
use marketflow_proxy::ProxyConfig;
use marketflow_sinks::PubSubBatchSettings;
use marketflow_ws::{HeartbeatConfig, ReconnectConfig, StreamKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_adapter_instances")]
    pub max_adapter_instances: usize,
    #[serde(default)]
    pub adapters: Vec<AdapterEntry>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub cache: CacheEntry,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_adapter_instances() -> usize {
    8
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_adapter_instances: default_max_adapter_instances(),
            adapters: Vec::new(),
            engine: EngineConfig::default(),
            routes: Vec::new(),
            pubsub: PubSubConfig::default(),
            cache: CacheEntry::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("failed to read config: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from the default path when present, else built-in defaults.
    pub fn load(path: &str) -> AppResult<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            tracing::warn!(%path, "Config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

/// One exchange adapter entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterEntry {
    pub name: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    #[serde(default)]
    pub reconnect: ReconnectEntry,
    #[serde(default)]
    pub heartbeat: HeartbeatEntry,
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_max_streams() -> usize {
    1024
}

impl AdapterEntry {
    pub fn to_adapter_config(&self) -> AppResult<AdapterConfig> {
        let subscriptions = self
            .subscriptions
            .iter()
            .map(SubscriptionEntry::to_spec)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(AdapterConfig {
            exchange: self.exchange.clone(),
            ws_url: self.ws_url.clone(),
            subscriptions,
            max_streams: self.max_streams,
            reconnect: self.reconnect.to_config(),
            heartbeat: self.heartbeat.to_config(),
        })
    }
}

/// One abstract subscription in config form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionEntry {
    pub symbol: String,
    /// `trade`, `ticker`, `depth` or `kline_<interval>`.
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub depth_levels: Option<u16>,
    #[serde(default)]
    pub depth_speed_ms: Option<u16>,
}

impl SubscriptionEntry {
    pub fn to_spec(&self) -> AppResult<SubscriptionSpec> {
        let kind = match self.data_type.as_str() {
            "trade" => StreamKind::Trade,
            "ticker" => StreamKind::Ticker,
            "depth" => StreamKind::Depth {
                levels: self.depth_levels,
                speed_ms: self.depth_speed_ms,
            },
            other => {
                let Some(interval) = other.strip_prefix("kline_") else {
                    return Err(AppError::Config(format!(
                        "unknown subscription type: {other}"
                    )));
                };
                let interval = interval.parse().map_err(|_| {
                    AppError::Config(format!("unknown kline interval: {interval}"))
                })?;
                StreamKind::Kline(interval)
            }
        };
        Ok(SubscriptionSpec {
            symbol: self.symbol.clone(),
            kind,
        })
    }
}

/// Reconnect tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectEntry {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_retries() -> u32 {
    10
}

impl Default for ReconnectEntry {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_retries: default_max_retries(),
        }
    }
}

impl ReconnectEntry {
    pub fn to_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            max_retries: self.max_retries,
            ..Default::default()
        }
    }
}

/// Heartbeat tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatEntry {
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_response_timeout_ms: u64,
    #[serde(default = "default_ping_threshold_ms")]
    pub ping_timeout_threshold_ms: u64,
    #[serde(default = "default_expected_interval_ms")]
    pub expected_ping_interval_ms: u64,
}

fn default_pong_timeout_ms() -> u64 {
    5_000
}

fn default_ping_threshold_ms() -> u64 {
    60_000
}

fn default_expected_interval_ms() -> u64 {
    20_000
}

impl Default for HeartbeatEntry {
    fn default() -> Self {
        Self {
            pong_response_timeout_ms: default_pong_timeout_ms(),
            ping_timeout_threshold_ms: default_ping_threshold_ms(),
            expected_ping_interval_ms: default_expected_interval_ms(),
        }
    }
}

impl HeartbeatEntry {
    pub fn to_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            pong_response_timeout: Duration::from_millis(self.pong_response_timeout_ms),
            ping_timeout_threshold: Duration::from_millis(self.ping_timeout_threshold_ms),
            expected_ping_interval: Duration::from_millis(self.expected_ping_interval_ms),
            allow_unsolicited_ping: false,
        }
    }
}

/// DataFlow engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,
    /// `block`, `drop_oldest` or `drop_new`.
    #[serde(default = "default_backpressure")]
    pub backpressure: String,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_sink_max_retries")]
    pub sink_max_retries: u32,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Drop records below this quality score. 0 disables the filter.
    #[serde(default)]
    pub min_quality: f64,
}

fn default_ingress_capacity() -> usize {
    10_000
}

fn default_backpressure() -> String {
    "block".to_string()
}

fn default_submit_timeout_ms() -> u64 {
    50
}

fn default_outbox_capacity() -> usize {
    1_000
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    100
}

fn default_sink_max_retries() -> u32 {
    3
}

fn default_drain_timeout_secs() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: default_ingress_capacity(),
            backpressure: default_backpressure(),
            submit_timeout_ms: default_submit_timeout_ms(),
            outbox_capacity: default_outbox_capacity(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            sink_max_retries: default_sink_max_retries(),
            drain_timeout_secs: default_drain_timeout_secs(),
            min_quality: 0.0,
        }
    }
}

impl EngineConfig {
    pub fn to_flow_config(&self) -> AppResult<FlowConfig> {
        let backpressure = match self.backpressure.as_str() {
            "block" => BackpressurePolicy::Block,
            "drop_oldest" => BackpressurePolicy::DropOldest,
            "drop_new" => BackpressurePolicy::DropNew,
            other => {
                return Err(AppError::Config(format!(
                    "unknown backpressure policy: {other}"
                )))
            }
        };
        Ok(FlowConfig {
            ingress_capacity: self.ingress_capacity,
            backpressure,
            submit_timeout: Duration::from_millis(self.submit_timeout_ms),
            outbox_capacity: self.outbox_capacity,
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            sink_max_retries: self.sink_max_retries,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..Default::default()
        })
    }
}

/// One routing rule in config form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEntry {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub exchanges: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    pub targets: Vec<String>,
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
}

impl RouteEntry {
    pub fn to_rule(&self) -> RouteRule {
        let mut rule = RouteRule::new(
            self.id.clone(),
            self.priority,
            RouteMatcher {
                exchanges: self.exchanges.iter().cloned().collect(),
                symbols: self.symbols.iter().cloned().collect(),
                types: self.types.iter().cloned().collect(),
                metadata_tags: Default::default(),
            },
            self.targets.clone(),
        );
        rule.continue_matching = self.continue_matching;
        rule
    }
}

/// Pub/sub sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PubSubConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub ordering_enabled: bool,
    #[serde(default)]
    pub batch: PubSubBatchSettings,
}

fn default_topic_prefix() -> String {
    "market-data".to_string()
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic_prefix: default_topic_prefix(),
            ordering_enabled: false,
            batch: PubSubBatchSettings::default(),
        }
    }
}

/// Cache sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheEntry {
    #[serde(default = "default_cache_capacity")]
    pub capacity_per_key: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_ttl_secs() -> u64 {
    60
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            capacity_per_key: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollectorConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.engine.ingress_capacity, 10_000);
        assert_eq!(config.cache.capacity_per_key, 100);
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
log_level = "debug"

[[adapters]]
name = "binance"
enabled = true
subscriptions = [
    { symbol = "BTC/USDT", type = "trade" },
    { symbol = "ETH/USDT", type = "kline_5m" },
    { symbol = "ADA/USDT", type = "depth", depth_levels = 10, depth_speed_ms = 100 },
]

[engine]
ingress_capacity = 500
backpressure = "drop_oldest"

[[routes]]
id = "tickers-to-cache"
priority = 10
types = ["ticker"]
targets = ["cache"]

[pubsub]
enabled = true
topic_prefix = "md"

[proxy]
port = 9000
"#;
        let config: CollectorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.adapters.len(), 1);

        let adapter = config.adapters[0].to_adapter_config().unwrap();
        assert_eq!(adapter.subscriptions.len(), 3);
        assert!(matches!(
            adapter.subscriptions[2].kind,
            StreamKind::Depth {
                levels: Some(10),
                speed_ms: Some(100)
            }
        ));

        let flow = config.engine.to_flow_config().unwrap();
        assert_eq!(flow.ingress_capacity, 500);
        assert!(matches!(flow.backpressure, BackpressurePolicy::DropOldest));

        assert_eq!(config.routes[0].to_rule().priority, 10);
        assert_eq!(config.pubsub.topic_prefix, "md");
        assert_eq!(config.proxy.port, 9000);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let toml_str = r#"
log_level = "info"
not_a_real_key = 1
"#;
        assert!(toml::from_str::<CollectorConfig>(toml_str).is_err());
    }

    #[test]
    fn test_bad_subscription_type_rejected() {
        let entry = SubscriptionEntry {
            symbol: "BTC/USDT".to_string(),
            data_type: "candles".to_string(),
            depth_levels: None,
            depth_speed_ms: None,
        };
        assert!(entry.to_spec().is_err());
    }

    #[test]
    fn test_bad_backpressure_rejected() {
        let engine = EngineConfig {
            backpressure: "panic".to_string(),
            ..Default::default()
        };
        assert!(engine.to_flow_config().is_err());
    }
}
