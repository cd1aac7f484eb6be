use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::ModuleCtx;
use crate::health::HealthReport;
use crate::reload::ReloadChanges;

/// Core module: dependency wiring and one-time initialization.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A module with an async start/stop lifecycle, driven after every module's
/// `init` has completed.
#[async_trait]
pub trait StatefulModule: Send + Sync {
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;
    async fn stop(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// A module that can apply a validated configuration delta without a
/// process restart.
#[async_trait]
pub trait ReloadableModule: Send + Sync {
    async fn reload(&self, ctx: &ModuleCtx, changes: &ReloadChanges) -> anyhow::Result<()>;
}

/// A module that contributes a health report to the aggregator.
#[async_trait]
pub trait HealthCheckProvider: Send + Sync {
    async fn check(&self) -> anyhow::Result<HealthReport>;

    /// Whether `err` represents a transient condition that should be reported
    /// as degraded rather than unhealthy. Defaults to false.
    fn is_temporary(&self, _err: &anyhow::Error) -> bool {
        false
    }
}
