//! Application wiring.
//!
//! Builds the proxy, the dataflow engine with its sinks and routes, and
//! the adapter registry, then runs until a shutdown signal. Components are
//! constructed here and handed their dependencies explicitly; nothing
//! reaches out to process-wide state.

use crate::config::CollectorConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use marketflow_adapter::{
    AdapterRegistration, AdapterRegistry, ExchangeAdapterFactory,
};
use marketflow_flow::{
    DataFlowEngine, FlowHandle, FlowResult, MinQualityFilter, RouteMatcher, RouteRule, Router,
};
use marketflow_proxy::{ProxyConfig, WebSocketProxy};
use marketflow_sinks::{
    CacheConfig, CacheSink, DefaultTopicStrategy, ProxySink, PubSubMessage, PubSubSink,
    TopicPublisher,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sink id constants used by default routing.
const SINK_PUBSUB: &str = "pubsub";
const SINK_CACHE: &str = "cache";
const SINK_PROXY: &str = "proxy";

/// Fallback publisher used when no concrete provider is wired in. Logs and
/// drops; deployments embed the collector as a library and inject their
/// provider through `Application::with_publisher`.
struct LogPublisher;

#[async_trait]
impl TopicPublisher for LogPublisher {
    async fn publish(&self, topic: &str, messages: Vec<PubSubMessage>) -> FlowResult<()> {
        debug!(topic, count = messages.len(), "Publish (log-only provider)");
        Ok(())
    }

    async fn shutdown(&self) -> FlowResult<()> {
        Ok(())
    }
}

/// The collector application.
pub struct Application {
    config: CollectorConfig,
    publisher: Arc<dyn TopicPublisher>,
    proxy: Arc<WebSocketProxy>,
    flow: Option<FlowHandle>,
    /// The engine task is joined (not aborted) on shutdown so its drain
    /// completes.
    engine_task: Option<JoinHandle<()>>,
    registry: Option<Arc<AdapterRegistry>>,
    background: Vec<JoinHandle<()>>,
}

impl Application {
    pub fn new(config: CollectorConfig) -> Self {
        let proxy = Arc::new(WebSocketProxy::new(config.proxy.clone()));
        Self {
            config,
            publisher: Arc::new(LogPublisher),
            proxy,
            flow: None,
            engine_task: None,
            registry: None,
            background: Vec::new(),
        }
    }

    /// Inject the concrete pub/sub provider.
    pub fn with_publisher(mut self, publisher: Arc<dyn TopicPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn proxy(&self) -> Arc<WebSocketProxy> {
        Arc::clone(&self.proxy)
    }

    pub fn flow(&self) -> Option<&FlowHandle> {
        self.flow.as_ref()
    }

    /// Build and start every component.
    pub async fn start(&mut self) -> AppResult<()> {
        info!("Starting collector");

        // Proxy server.
        if self.config.proxy.enabled {
            let proxy = Arc::clone(&self.proxy);
            self.background.push(tokio::spawn(async move {
                if let Err(e) = marketflow_proxy::run_server(proxy).await {
                    warn!(error = %e, "Proxy server exited");
                }
            }));
        }

        // DataFlow engine with sinks and routes.
        let mut engine = DataFlowEngine::new(self.config.engine.to_flow_config()?);
        if self.config.engine.min_quality > 0.0 {
            engine.add_transformer(Arc::new(MinQualityFilter::new(
                "min-quality",
                self.config.engine.min_quality,
            )));
        }

        let mut sink_ids = Vec::new();
        if self.config.pubsub.enabled {
            engine.register_sink(Arc::new(PubSubSink::new(
                SINK_PUBSUB,
                Arc::clone(&self.publisher),
                Box::new(DefaultTopicStrategy::new(
                    self.config.pubsub.topic_prefix.clone(),
                )),
                self.config.pubsub.ordering_enabled,
                self.config.pubsub.batch.clone(),
            )));
            sink_ids.push(SINK_PUBSUB.to_string());
        }
        engine.register_sink(Arc::new(CacheSink::new(
            SINK_CACHE,
            CacheConfig {
                capacity_per_key: self.config.cache.capacity_per_key,
                ttl: Duration::from_secs(self.config.cache.ttl_secs),
            },
        )));
        sink_ids.push(SINK_CACHE.to_string());
        engine.register_sink(Arc::new(ProxySink::new(SINK_PROXY, Arc::clone(&self.proxy))));
        sink_ids.push(SINK_PROXY.to_string());

        let mut rules: Vec<RouteRule> = self
            .config
            .routes
            .iter()
            .map(|entry| entry.to_rule())
            .collect();
        // Catch-all at the lowest priority so unconfigured deployments
        // still deliver everywhere.
        rules.push(RouteRule::new(
            "default",
            i32::MIN,
            RouteMatcher::any(),
            sink_ids,
        ));
        engine.set_router(Router::new(rules));

        let flow = engine.handle();
        self.engine_task = Some(tokio::spawn(engine.run()));
        self.flow = Some(flow.clone());

        // Adapter registry.
        let registry = Arc::new(AdapterRegistry::new(
            flow,
            self.config.max_adapter_instances,
        ));
        let mut auto = Vec::new();
        for entry in &self.config.adapters {
            registry.register(
                entry.name.clone(),
                AdapterRegistration {
                    factory: Arc::new(ExchangeAdapterFactory),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    description: format!("{} market data adapter", entry.exchange),
                    enabled: entry.enabled,
                    features: entry
                        .subscriptions
                        .iter()
                        .map(|s| s.data_type.clone())
                        .collect(),
                },
            )?;
            if entry.enabled {
                auto.push((entry.name.clone(), entry.to_adapter_config()?));
            }
        }
        for (name, result) in registry.start_auto_adapters(auto).await {
            match result {
                Ok(()) => info!(adapter = %name, "Adapter running"),
                Err(e) => warn!(adapter = %name, error = %e, "Adapter failed to start"),
            }
        }
        self.registry = Some(registry);

        info!("Collector started");
        Ok(())
    }

    /// Run until SIGINT, then shut down in dependency order: adapters
    /// first (no new ingress), then the engine drain, then the proxy.
    pub async fn run(&mut self) -> AppResult<()> {
        self.start().await?;

        tokio::signal::ctrl_c()
            .await
            .map_err(AppError::Io)?;
        info!("Shutdown signal received");

        self.shutdown().await;
        Ok(())
    }

    /// Ordered shutdown.
    pub async fn shutdown(&mut self) {
        if let Some(registry) = &self.registry {
            registry.stop_all_instances().await;
        }
        if let Some(flow) = &self.flow {
            flow.stop();
        }
        // Wait for the engine to drain ingress and flush its outboxes; a
        // blown budget escalates to a forced close before teardown.
        if let Some(engine_task) = self.engine_task.take() {
            let drain_timeout = Duration::from_secs(self.config.engine.drain_timeout_secs);
            if tokio::time::timeout(drain_timeout, engine_task)
                .await
                .is_err()
            {
                warn!("Engine drain exceeded budget, forcing close");
                if let Some(flow) = &self.flow {
                    flow.stop();
                }
            }
        }
        for task in self.background.drain(..) {
            task.abort();
        }
        info!("Collector stopped");
    }

    pub async fn registry_status(&self) -> Option<marketflow_adapter::RegistryStatus> {
        match &self.registry {
            Some(registry) => Some(registry.status().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectorConfig;

    #[tokio::test]
    async fn test_start_with_defaults_and_shutdown() {
        // No adapters, proxy disabled: just the engine and sinks.
        let mut config = CollectorConfig::default();
        config.proxy.enabled = false;

        let mut app = Application::new(config);
        app.start().await.unwrap();
        assert!(app.flow().is_some());

        // The engine accepts records through the handle.
        let flow = app.flow().unwrap().clone();
        let snapshot = flow.snapshot();
        assert_eq!(snapshot.submit_accepted, 0);
        // Cache and proxy sinks are always registered.
        assert!(snapshot.sinks.contains_key("cache"));
        assert!(snapshot.sinks.contains_key("proxy"));
        assert!(!snapshot.sinks.contains_key("pubsub"));

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_pubsub_sink_registered_when_enabled() {
        let mut config = CollectorConfig::default();
        config.proxy.enabled = false;
        config.pubsub.enabled = true;

        let mut app = Application::new(config);
        app.start().await.unwrap();
        let snapshot = app.flow().unwrap().snapshot();
        assert!(snapshot.sinks.contains_key("pubsub"));
        app.shutdown().await;
    }
}
