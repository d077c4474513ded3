//! Exchange adapter lifecycle and registry.
//!
//! An `AdapterIntegration` wraps a connection, its subscriptions and the
//! frame parser into one lifecycle object bridging exchange frames into
//! the dataflow engine. The `AdapterRegistry` owns factories and running
//! instances, and tears everything down in reverse registration order.

pub mod error;
pub mod integration;
pub mod registry;

pub use error::{AdapterError, AdapterResult};
pub use integration::{
    AdapterConfig, AdapterIntegration, AdapterStatus, HealthReport, IntegrationMetricsSnapshot,
    SubscriptionSpec,
};
pub use registry::{
    AdapterFactory, AdapterRegistration, AdapterRegistry, ExchangeAdapterFactory, InstanceStatus,
    RegistryStatus,
};
