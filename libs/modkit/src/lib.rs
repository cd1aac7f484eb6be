//! Core ModKit library: module dependency resolution, lifecycle orchestration,
//! layered configuration, and the service/event/health/reload plumbing that
//! sits in between.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod client_hub;
pub mod config;
pub mod config_builder;
pub mod context;
pub mod contracts;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod observer;
pub mod registry;
pub mod reload;
pub mod service_registry;
pub mod telemetry;
pub mod tenant;

pub use client_hub::ClientHub;
pub use context::{ModuleCtx, ModuleContextBuilder};
pub use contracts::{HealthCheckProvider, Module, ReloadableModule, StatefulModule};
pub use error::ModkitError;
pub use health::{HealthAggregator, HealthReport, HealthStatus};
pub use lifecycle::{LifecycleError, LifecycleOrchestrator};
pub use observer::{Event, Observer, ObserverSubject};
pub use registry::{ModuleRegistry, RegistryBuilder, RegistryError, Registrator};
pub use reload::{ReloadChanges, ReloadOrchestrator};
pub use service_registry::{CapabilityDescriptor, ConflictPolicy, ServiceRegistry};
pub use tenant::{TenantId, TenantRegistry};
