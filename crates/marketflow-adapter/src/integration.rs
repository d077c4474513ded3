//! Adapter integration: one exchange, one lifecycle object.
//!
//! Owns the connection manager, the subscription table and the parser, and
//! runs the bridge task that turns raw frames into engine submissions.
//! Lifecycle: `initialize -> start -> stop -> destroy`; invalid
//! transitions fail with `InvalidState`.

use crate::error::{AdapterError, AdapterResult};
use chrono::{DateTime, Utc};
use marketflow_feed::MessageParser;
use marketflow_flow::{EnqueueResult, FlowHandle};
use marketflow_telemetry::metrics;
use marketflow_ws::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState,
    HeartbeatConfig, ReconnectConfig, StreamKind, SubscriptionManager,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// EWMA factor for the rolling latency and quality figures.
const EWMA_ALPHA: f64 = 0.2;
/// An adapter with no activity for this long reports unhealthy.
const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// One abstract subscription request.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub symbol: String,
    pub kind: StreamKind,
}

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Lowercase exchange id (e.g. `binance`), used on every record.
    pub exchange: String,
    /// Base WebSocket URL.
    pub ws_url: String,
    pub subscriptions: Vec<SubscriptionSpec>,
    pub max_streams: usize,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            exchange: "binance".to_string(),
            ws_url: "wss://stream.binance.com:9443".to_string(),
            subscriptions: Vec::new(),
            max_streams: marketflow_ws::stream_name::MAX_STREAMS_PER_CONNECTION,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Adapter lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    Created,
    Initialized,
    Running,
    Stopped,
    Error,
}

impl AdapterStatus {
    /// Numeric gauge value (0..3); `Stopped` and `Error` both read 0.
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Stopped | Self::Error => 0,
            Self::Created => 1,
            Self::Initialized => 2,
            Self::Running => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// Rolling counters shared with the bridge task.
#[derive(Debug, Default)]
struct IntegrationMetrics {
    messages_processed: AtomicU64,
    messages_published: AtomicU64,
    processing_errors: AtomicU64,
    publish_errors: AtomicU64,
    /// EWMA processing latency, microseconds (f64 bits).
    avg_latency_us_bits: AtomicU64,
    /// EWMA quality score x1e6.
    quality_score_ppm: AtomicU64,
    /// Last frame activity, ms since epoch (0 = never).
    last_activity_ms: AtomicI64,
}

impl IntegrationMetrics {
    fn observe_frame(&self, latency: Duration, quality: f64, now_ms: i64) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);

        let obs_us = latency.as_secs_f64() * 1e6;
        let prev = f64::from_bits(self.avg_latency_us_bits.load(Ordering::Relaxed));
        let next = if prev == 0.0 {
            obs_us
        } else {
            EWMA_ALPHA * obs_us + (1.0 - EWMA_ALPHA) * prev
        };
        self.avg_latency_us_bits
            .store(next.to_bits(), Ordering::Relaxed);

        let prev_q = self.quality_score_ppm.load(Ordering::Relaxed);
        let next_q = if prev_q == 0 {
            quality * 1e6
        } else {
            EWMA_ALPHA * quality * 1e6 + (1.0 - EWMA_ALPHA) * prev_q as f64
        };
        self.quality_score_ppm
            .store(next_q as u64, Ordering::Relaxed);
    }
}

/// Point-in-time metrics for one adapter instance.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationMetricsSnapshot {
    pub status: &'static str,
    pub messages_processed: u64,
    pub messages_published: u64,
    pub processing_errors: u64,
    pub publish_errors: u64,
    pub avg_processing_latency_ms: f64,
    pub quality_score: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Health check result.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: &'static str,
    pub reason: Option<String>,
}

/// One exchange adapter: connection + subscriptions + parser + bridge.
pub struct AdapterIntegration {
    name: String,
    config: AdapterConfig,
    status: AdapterStatus,
    subscriptions: Arc<SubscriptionManager>,
    parser: Arc<MessageParser>,
    engine: FlowHandle,
    metrics: Arc<IntegrationMetrics>,
    connection: Option<ConnectionHandle>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AdapterIntegration {
    pub fn new(name: impl Into<String>, config: AdapterConfig, engine: FlowHandle) -> Self {
        let name = name.into();
        Self {
            subscriptions: Arc::new(SubscriptionManager::with_limit(
                name.clone(),
                config.max_streams,
            )),
            parser: Arc::new(MessageParser::new(config.exchange.clone())),
            metrics: Arc::new(IntegrationMetrics::default()),
            connection: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            status: AdapterStatus::Created,
            name,
            config,
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> AdapterStatus {
        self.status
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Validate configuration and build the subscription table.
    pub fn initialize(&mut self) -> AdapterResult<()> {
        if self.status != AdapterStatus::Created {
            return Err(AdapterError::InvalidState(format!(
                "initialize from {}",
                self.status.as_str()
            )));
        }
        if !self.config.ws_url.starts_with("ws://") && !self.config.ws_url.starts_with("wss://") {
            return Err(AdapterError::Config(format!(
                "not a WebSocket URL: {}",
                self.config.ws_url
            )));
        }
        if self.config.subscriptions.is_empty() {
            return Err(AdapterError::Config("no subscriptions configured".to_string()));
        }
        for spec in &self.config.subscriptions {
            self.subscriptions
                .subscribe(&spec.symbol, spec.kind)
                .map_err(AdapterError::Ws)?;
        }
        self.set_status(AdapterStatus::Initialized);
        info!(
            adapter = %self.name,
            streams = self.subscriptions.len(),
            "Adapter initialized"
        );
        Ok(())
    }

    /// Spawn the connection loop and the frame bridge.
    pub fn start(&mut self) -> AdapterResult<()> {
        if !matches!(
            self.status,
            AdapterStatus::Initialized | AdapterStatus::Stopped
        ) {
            return Err(AdapterError::InvalidState(format!(
                "start from {}",
                self.status.as_str()
            )));
        }

        self.cancel = CancellationToken::new();
        self.subscriptions.reset_for_reconnect();

        let connection_config = ConnectionConfig {
            id: self.name.clone(),
            base_url: self.config.ws_url.clone(),
            initial_streams: self.subscriptions.stream_names(),
            max_streams: self.config.max_streams,
            reconnect: self.config.reconnect.clone(),
            heartbeat: self.config.heartbeat.clone(),
            ..Default::default()
        };
        let (manager, handle, events) = ConnectionManager::new(connection_config);
        self.connection = Some(handle.clone());

        self.tasks
            .push(tokio::spawn(manager.run(self.cancel.clone())));
        self.tasks.push(tokio::spawn(bridge_loop(
            self.name.clone(),
            events,
            handle,
            Arc::clone(&self.parser),
            Arc::clone(&self.subscriptions),
            self.engine.clone(),
            Arc::clone(&self.metrics),
            self.cancel.clone(),
        )));

        self.set_status(AdapterStatus::Running);
        info!(adapter = %self.name, "Adapter started");
        Ok(())
    }

    /// Stop the connection and the bridge; the instance can be restarted.
    pub async fn stop(&mut self) -> AdapterResult<()> {
        if self.status != AdapterStatus::Running {
            return Err(AdapterError::InvalidState(format!(
                "stop from {}",
                self.status.as_str()
            )));
        }
        if let Some(connection) = &self.connection {
            let _ = connection.close("adapter stop").await;
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!(adapter = %self.name, "Task did not stop in time");
            }
        }
        self.connection = None;
        self.set_status(AdapterStatus::Stopped);
        info!(adapter = %self.name, "Adapter stopped");
        Ok(())
    }

    /// Tear down entirely. Running instances are stopped first.
    pub async fn destroy(&mut self) -> AdapterResult<()> {
        if self.status == AdapterStatus::Running {
            self.stop().await?;
        }
        self.set_status(AdapterStatus::Stopped);
        Ok(())
    }

    /// Unhealthy when not running, not yet active, or silent for over a
    /// minute.
    pub fn health(&self) -> HealthReport {
        if self.status != AdapterStatus::Running {
            return HealthReport {
                healthy: false,
                status: self.status.as_str(),
                reason: Some(format!("status is {}", self.status.as_str())),
            };
        }
        if let Some(connection) = &self.connection {
            let state = connection.state();
            if !matches!(state, ConnectionState::Active | ConnectionState::Connected) {
                return HealthReport {
                    healthy: false,
                    status: self.status.as_str(),
                    reason: Some(format!("connection is {state}")),
                };
            }
        }
        let last_ms = self.metrics.last_activity_ms.load(Ordering::Relaxed);
        let silent = last_ms == 0
            || Utc::now().timestamp_millis() - last_ms > ACTIVITY_TIMEOUT.as_millis() as i64;
        if silent {
            return HealthReport {
                healthy: false,
                status: self.status.as_str(),
                reason: Some("no activity within 60s".to_string()),
            };
        }
        HealthReport {
            healthy: true,
            status: self.status.as_str(),
            reason: None,
        }
    }

    pub fn metrics_snapshot(&self) -> IntegrationMetricsSnapshot {
        let m = &self.metrics;
        let last_ms = m.last_activity_ms.load(Ordering::Relaxed);
        IntegrationMetricsSnapshot {
            status: self.status.as_str(),
            messages_processed: m.messages_processed.load(Ordering::Relaxed),
            messages_published: m.messages_published.load(Ordering::Relaxed),
            processing_errors: m.processing_errors.load(Ordering::Relaxed),
            publish_errors: m.publish_errors.load(Ordering::Relaxed),
            avg_processing_latency_ms: f64::from_bits(
                m.avg_latency_us_bits.load(Ordering::Relaxed),
            ) / 1000.0,
            quality_score: m.quality_score_ppm.load(Ordering::Relaxed) as f64 / 1e6,
            last_activity: (last_ms > 0).then(|| {
                DateTime::from_timestamp_millis(last_ms).unwrap_or_else(Utc::now)
            }),
        }
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    fn set_status(&mut self, status: AdapterStatus) {
        self.status = status;
        metrics::ADAPTER_STATUS
            .with_label_values(&[&self.name])
            .set(status.as_gauge());
    }
}

/// Consume connection events: parse frames, track subscription activity
/// and push normalized records into the engine.
#[allow(clippy::too_many_arguments)]
async fn bridge_loop(
    adapter: String,
    mut events: tokio::sync::mpsc::Receiver<ConnectionEvent>,
    connection: ConnectionHandle,
    parser: Arc<MessageParser>,
    subscriptions: Arc<SubscriptionManager>,
    engine: FlowHandle,
    metrics_state: Arc<IntegrationMetrics>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            ConnectionEvent::Framed(raw) => {
                let started = Instant::now();
                match parser.parse(&raw) {
                    Ok(frame) => {
                        subscriptions.record_message(&frame.stream);
                        metrics::FEED_FRAMES_TOTAL
                            .with_label_values(&[&adapter, "accepted"])
                            .inc();
                        metrics::FEED_QUALITY
                            .with_label_values(&[&adapter])
                            .observe(frame.data.metadata.quality);
                        let quality = frame.data.metadata.quality;
                        let submitted = engine.submit(frame.data).await;
                        metrics_state.observe_frame(
                            started.elapsed(),
                            quality,
                            Utc::now().timestamp_millis(),
                        );
                        match submitted {
                            EnqueueResult::Accepted => {
                                metrics_state
                                    .messages_published
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                            EnqueueResult::Rejected(reason) => {
                                metrics_state.publish_errors.fetch_add(1, Ordering::Relaxed);
                                debug!(adapter = %adapter, ?reason, "Engine rejected record");
                            }
                        }
                    }
                    Err(e) => {
                        metrics_state
                            .processing_errors
                            .fetch_add(1, Ordering::Relaxed);
                        let outcome = match &e {
                            marketflow_feed::FeedError::UnknownEvent(_) => "unknown_event",
                            marketflow_feed::FeedError::Validation { .. } => "validation_error",
                            _ => "parse_error",
                        };
                        metrics::FEED_FRAMES_TOTAL
                            .with_label_values(&[&adapter, outcome])
                            .inc();
                        debug!(adapter = %adapter, error = %e, "Frame dropped");
                    }
                }
            }
            ConnectionEvent::StateChanged(state) => {
                debug!(adapter = %adapter, state = %state, "Connection state changed");
            }
            ConnectionEvent::Error(message) => {
                if connection.state() == ConnectionState::Error {
                    warn!(adapter = %adapter, %message, "Connection escalated to error");
                }
            }
            ConnectionEvent::Open
            | ConnectionEvent::Closed { .. }
            | ConnectionEvent::PingReceived
            | ConnectionEvent::PongSent => {}
        }
    }
}
