//! Adapter registry: factories, instances and aggregate status.
//!
//! Factories are registered by name; instances are created from enabled
//! registrations, bounded by an instance ceiling, and destroyed in reverse
//! registration order on shutdown.

use crate::error::{AdapterError, AdapterResult};
use crate::integration::{
    AdapterConfig, AdapterIntegration, AdapterStatus, HealthReport, IntegrationMetricsSnapshot,
};
use marketflow_flow::FlowHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Creates adapter instances for one exchange family.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        config: AdapterConfig,
        engine: FlowHandle,
    ) -> AdapterResult<AdapterIntegration>;
}

/// The stock factory: builds a plain `AdapterIntegration`.
pub struct ExchangeAdapterFactory;

impl AdapterFactory for ExchangeAdapterFactory {
    fn create(
        &self,
        name: &str,
        config: AdapterConfig,
        engine: FlowHandle,
    ) -> AdapterResult<AdapterIntegration> {
        Ok(AdapterIntegration::new(name, config, engine))
    }
}

/// A registered adapter family.
pub struct AdapterRegistration {
    pub factory: Arc<dyn AdapterFactory>,
    pub version: String,
    pub description: String,
    pub enabled: bool,
    pub features: Vec<String>,
}

/// Status of one running instance.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub name: String,
    pub status: &'static str,
    pub health: HealthReport,
    pub metrics: IntegrationMetricsSnapshot,
}

/// Aggregate registry status.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub registered: Vec<(String, bool)>,
    pub instances: Vec<InstanceStatus>,
}

/// Owns adapter factories and running instances.
pub struct AdapterRegistry {
    engine: FlowHandle,
    max_instances: usize,
    registrations: RwLock<HashMap<String, AdapterRegistration>>,
    /// Registration order, for reverse-order shutdown.
    order: RwLock<Vec<String>>,
    instances: Mutex<HashMap<String, AdapterIntegration>>,
}

impl AdapterRegistry {
    pub fn new(engine: FlowHandle, max_instances: usize) -> Self {
        Self {
            engine,
            max_instances,
            registrations: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Register an adapter factory under a name.
    pub fn register(
        &self,
        name: impl Into<String>,
        registration: AdapterRegistration,
    ) -> AdapterResult<()> {
        let name = name.into();
        let mut registrations = self.registrations.write();
        if registrations.contains_key(&name) {
            return Err(AdapterError::InvalidState(format!(
                "adapter already registered: {name}"
            )));
        }
        info!(adapter = %name, version = %registration.version, "Adapter registered");
        registrations.insert(name.clone(), registration);
        self.order.write().push(name);
        Ok(())
    }

    /// Remove a registration. Fails while an instance exists.
    pub async fn unregister(&self, name: &str) -> AdapterResult<()> {
        if self.instances.lock().await.contains_key(name) {
            return Err(AdapterError::InvalidState(format!(
                "instance still exists: {name}"
            )));
        }
        let removed = self.registrations.write().remove(name);
        if removed.is_none() {
            return Err(AdapterError::AdapterNotFound(name.to_string()));
        }
        self.order.write().retain(|n| n != name);
        Ok(())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> AdapterResult<()> {
        let mut registrations = self.registrations.write();
        let registration = registrations
            .get_mut(name)
            .ok_or_else(|| AdapterError::AdapterNotFound(name.to_string()))?;
        registration.enabled = enabled;
        Ok(())
    }

    /// Create and initialize an instance of a registered, enabled adapter.
    pub async fn create_instance(&self, name: &str, config: AdapterConfig) -> AdapterResult<()> {
        let factory = {
            let registrations = self.registrations.read();
            let registration = registrations
                .get(name)
                .ok_or_else(|| AdapterError::AdapterNotFound(name.to_string()))?;
            if !registration.enabled {
                return Err(AdapterError::AdapterDisabled(name.to_string()));
            }
            Arc::clone(&registration.factory)
        };

        let mut instances = self.instances.lock().await;
        if instances.contains_key(name) {
            return Err(AdapterError::InvalidState(format!(
                "instance already exists: {name}"
            )));
        }
        if instances.len() >= self.max_instances {
            return Err(AdapterError::InstanceLimitReached(self.max_instances));
        }

        let mut instance = factory.create(name, config, self.engine.clone())?;
        instance.initialize()?;
        instances.insert(name.to_string(), instance);
        Ok(())
    }

    pub async fn start_instance(&self, name: &str) -> AdapterResult<()> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| AdapterError::InvalidState(format!("no instance: {name}")))?;
        instance.start()
    }

    pub async fn stop_instance(&self, name: &str) -> AdapterResult<()> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| AdapterError::InvalidState(format!("no instance: {name}")))?;
        instance.stop().await
    }

    pub async fn destroy_instance(&self, name: &str) -> AdapterResult<()> {
        let mut instances = self.instances.lock().await;
        let mut instance = instances
            .remove(name)
            .ok_or_else(|| AdapterError::InvalidState(format!("no instance: {name}")))?;
        instance.destroy().await
    }

    /// Create and start every enabled adapter with a config entry.
    /// Failures are reported per adapter without aborting the rest.
    pub async fn start_auto_adapters(
        &self,
        configs: Vec<(String, AdapterConfig)>,
    ) -> Vec<(String, AdapterResult<()>)> {
        let mut results = Vec::new();
        for (name, config) in configs {
            let result = async {
                self.create_instance(&name, config).await?;
                self.start_instance(&name).await
            }
            .await;
            if let Err(e) = &result {
                warn!(adapter = %name, error = %e, "Auto-start failed");
            }
            results.push((name, result));
        }
        results
    }

    /// Stop and destroy every instance, in reverse registration order.
    pub async fn stop_all_instances(&self) {
        let order: Vec<String> = self.order.read().clone();
        let mut instances = self.instances.lock().await;
        for name in order.iter().rev() {
            if let Some(mut instance) = instances.remove(name) {
                if instance.status() == AdapterStatus::Running {
                    if let Err(e) = instance.stop().await {
                        warn!(adapter = %name, error = %e, "Stop failed during shutdown");
                    }
                }
                let _ = instance.destroy().await;
                info!(adapter = %name, "Instance destroyed");
            }
        }
    }

    /// Aggregate view over registrations and instances.
    pub async fn status(&self) -> RegistryStatus {
        let registered: Vec<(String, bool)> = {
            let registrations = self.registrations.read();
            self.order
                .read()
                .iter()
                .filter_map(|name| {
                    registrations
                        .get(name)
                        .map(|r| (name.clone(), r.enabled))
                })
                .collect()
        };
        let instances = self.instances.lock().await;
        let instances = instances
            .values()
            .map(|instance| InstanceStatus {
                name: instance.name().to_string(),
                status: instance.status().as_str(),
                health: instance.health(),
                metrics: instance.metrics_snapshot(),
            })
            .collect();
        RegistryStatus {
            registered,
            instances,
        }
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }
}
