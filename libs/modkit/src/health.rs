//! Concurrent health aggregation across registered providers.
//!
//! Overall health is the worst status across every report; readiness is the
//! worst status across non-optional reports only, matching a liveness/
//! readiness split where an optional dependency being down shouldn't take
//! the process out of the load-balancer pool.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::contracts::HealthCheckProvider;
use crate::observer::{Event, ObserverSubject, EVENT_HEALTH_EVALUATED};
use crate::telemetry::ThrottledLog;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(250);
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_millis(200);
/// Minimum gap between repeated "still non-healthy" log lines for the same
/// provider, so a stuck dependency doesn't flood logs once per evaluation.
pub const DEFAULT_UNHEALTHY_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// No report has been collected for this provider yet, or its status
    /// could not be determined at all. Ranks worse than `Unhealthy`.
    Unknown,
}

impl HealthStatus {
    const fn label(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    #[serde(skip)]
    pub checked_at: SystemTime,
}

impl HealthReport {
    #[must_use]
    pub fn healthy(name: impl Into<String>) -> Self {
        Self { name: name.into(), status: HealthStatus::Healthy, message: None, checked_at: SystemTime::now() }
    }

    #[must_use]
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            checked_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            checked_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateHealth {
    pub overall: HealthStatus,
    pub readiness: HealthStatus,
    pub reports: Vec<HealthReport>,
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health provider '{0}' is already registered")]
    HealthProviderAlreadyRegistered(String),
    #[error("health provider '{0}' is not registered")]
    HealthProviderNotRegistered(String),
}

struct ProviderEntry {
    name: String,
    provider: Arc<dyn HealthCheckProvider>,
    optional: bool,
    unhealthy_log: Arc<ThrottledLog>,
}

pub struct HealthAggregator {
    providers: RwLock<Vec<ProviderEntry>>,
    cache: RwLock<Option<(Instant, AggregateHealth)>>,
    ttl: Duration,
    provider_timeout: Duration,
    observers: Arc<ObserverSubject>,
    last_overall: RwLock<Option<HealthStatus>>,
}

impl HealthAggregator {
    #[must_use]
    pub fn new(observers: Arc<ObserverSubject>) -> Self {
        Self::with_config(observers, DEFAULT_CACHE_TTL, DEFAULT_PROVIDER_TIMEOUT)
    }

    #[must_use]
    pub fn with_config(observers: Arc<ObserverSubject>, ttl: Duration, provider_timeout: Duration) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            cache: RwLock::new(None),
            ttl,
            provider_timeout,
            observers,
            last_overall: RwLock::new(None),
        }
    }

    /// # Errors
    /// Returns [`HealthError::HealthProviderAlreadyRegistered`] if `name` is already registered.
    pub fn register(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn HealthCheckProvider>,
        optional: bool,
    ) -> Result<(), HealthError> {
        let name = name.into();
        let mut providers = self.providers.write();
        if providers.iter().any(|p| p.name == name) {
            return Err(HealthError::HealthProviderAlreadyRegistered(name));
        }
        providers.push(ProviderEntry {
            name,
            provider,
            optional,
            unhealthy_log: Arc::new(ThrottledLog::new(DEFAULT_UNHEALTHY_LOG_INTERVAL)),
        });
        Ok(())
    }

    /// # Errors
    /// Returns [`HealthError::HealthProviderNotRegistered`] if `name` was never registered.
    pub fn unregister(&self, name: &str) -> Result<(), HealthError> {
        let mut providers = self.providers.write();
        let before = providers.len();
        providers.retain(|p| p.name != name);
        if providers.len() == before {
            return Err(HealthError::HealthProviderNotRegistered(name.to_owned()));
        }
        Ok(())
    }

    /// Evaluate the aggregate health, serving from the TTL cache unless
    /// `force_refresh` is set.
    pub async fn evaluate(&self, force_refresh: bool) -> AggregateHealth {
        if !force_refresh {
            if let Some((fetched_at, cached)) = self.cache.read().as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return cached.clone();
                }
            }
        }

        let entries: Vec<(String, Arc<dyn HealthCheckProvider>, bool, Arc<ThrottledLog>)> = {
            let providers = self.providers.read();
            providers.iter().map(|p| (p.name.clone(), p.provider.clone(), p.optional, p.unhealthy_log.clone())).collect()
        };

        let timeout = self.provider_timeout;
        let checks = entries.into_iter().map(|(name, provider, optional, unhealthy_log)| {
            let name_for_timeout = name.clone();
            async move {
                let report = Self::run_one(&name_for_timeout, provider.as_ref(), timeout).await;
                if report.status != HealthStatus::Healthy && unhealthy_log.should_log() {
                    tracing::warn!(
                        provider = %name,
                        status = report.status.label(),
                        message = report.message.as_deref().unwrap_or_default(),
                        "health provider still non-healthy"
                    );
                }
                (report, optional)
            }
        });
        let results: Vec<(HealthReport, bool)> = futures_util::future::join_all(checks).await;

        let mut overall = HealthStatus::Healthy;
        let mut readiness = HealthStatus::Healthy;
        let mut reports = Vec::with_capacity(results.len());
        for (report, optional) in results {
            overall = overall.max(report.status);
            if !optional {
                readiness = readiness.max(report.status);
            }
            reports.push(report);
        }

        let aggregate = AggregateHealth { overall, readiness, reports };

        let mut last_overall = self.last_overall.write();
        let status_changed = *last_overall != Some(aggregate.overall);
        *last_overall = Some(aggregate.overall);
        drop(last_overall);

        *self.cache.write() = Some((Instant::now(), aggregate.clone()));

        let data = serde_json::json!({
            "overall": aggregate.overall,
            "readiness": aggregate.readiness,
            "statusChanged": status_changed,
        });
        if let Err(err) = self.observers.emit(Event::new("health-aggregator", EVENT_HEALTH_EVALUATED, data)).await {
            tracing::warn!(error = %err, "health.evaluated event rejected");
        }

        aggregate
    }

    async fn run_one(name: &str, provider: &dyn HealthCheckProvider, timeout: Duration) -> HealthReport {
        let checked: Result<Result<anyhow::Result<HealthReport>, tokio::time::error::Elapsed>, _> =
            AssertUnwindSafe(Self::checked_call(name, provider, timeout)).catch_unwind().await;

        match checked {
            Ok(Ok(Ok(report))) => report,
            Ok(Ok(Err(err))) => {
                if provider.is_temporary(&err) {
                    HealthReport::degraded(name, err.to_string())
                } else {
                    HealthReport::unhealthy(name, err.to_string())
                }
            }
            Ok(Err(_elapsed)) => HealthReport::unhealthy(name, "health check timed out"),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                HealthReport::unhealthy(name, format!("health check panicked: {message}"))
            }
        }
    }

    fn checked_call<'a>(
        name: &'a str,
        provider: &'a dyn HealthCheckProvider,
        timeout: Duration,
    ) -> impl Future<Output = Result<anyhow::Result<HealthReport>, tokio::time::error::Elapsed>> + 'a {
        let _ = name;
        tokio::time::timeout(timeout, provider.check())
    }
}
