//! Crate-level error aggregation.
//!
//! Public `Runtime` entry points (`init`, `start`, `stop`, `request_reload`,
//! `collect_health`) return `ModkitError` so a caller gets one matchable type
//! regardless of which subsystem failed. Module hook bodies keep using
//! `anyhow::Error`, as `Module::init` / `StatefulModule::{start,stop}` already
//! do — `ModkitError` only aggregates the *structured* per-subsystem enums.

use thiserror::Error;

use crate::config::ConfigError;
use crate::config_builder::ConfigBuildError;
use crate::health::HealthError;
use crate::lifecycle::LifecycleError;
use crate::observer::ObserverError;
use crate::registry::RegistryError;
use crate::reload::ReloadError;
use crate::service_registry::ServiceRegistryError;

#[derive(Debug, Error)]
pub enum ModkitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    ConfigBuild(#[from] ConfigBuildError),
    #[error(transparent)]
    ServiceRegistry(#[from] ServiceRegistryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Observer(#[from] ObserverError),
    #[error(transparent)]
    Reload(#[from] ReloadError),
    #[error(transparent)]
    Health(#[from] HealthError),
}
