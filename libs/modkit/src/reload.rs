//! Single-flight dynamic configuration reload orchestration.
//!
//! A single reload request sweeps every registered reloadable module, in
//! registration order, applying whichever part of `changes` each module
//! declared as dynamic. At most one sweep runs at a time; concurrent requests
//! wait behind a bounded queue and are rejected with `ReloadQueueFull` once
//! that bound is exceeded. The orchestrator as a whole enters exponential
//! backoff after a failed sweep and rejects new requests with `ReloadBackoff`
//! until its window elapses.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::context::ModuleCtx;
use crate::contracts::ReloadableModule;
use crate::observer::{
    Event, ObserverSubject, EVENT_CONFIG_RELOAD_COMPLETED, EVENT_CONFIG_RELOAD_FAILED, EVENT_CONFIG_RELOAD_NOOP,
    EVENT_CONFIG_RELOAD_STARTED,
};
use crate::telemetry::ThrottledLog;

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_MODULE_TIMEOUT: Duration = Duration::from_secs(30);
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(120);
/// Minimum gap between repeated "rejected, still in backoff" log lines, so a
/// caller retrying on a tight loop doesn't flood logs.
pub const DEFAULT_BACKOFF_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Noop,
}

/// A set of changed configuration fields, keyed by their dotted path, with
/// old/new values for diffing and for matching against a module's declared
/// dynamic fields.
#[derive(Debug, Clone, Default)]
pub struct ReloadChanges {
    pub changed_fields: HashMap<String, (Value, Value)>,
}

impl ReloadChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed_fields.is_empty()
    }

    #[must_use]
    pub fn intersects(&self, dynamic_fields: &HashSet<String>) -> bool {
        dynamic_fields.is_empty() || self.changed_fields.keys().any(|k| dynamic_fields.contains(k))
    }
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("a reload is already in progress")]
    ReloadInProgress,
    #[error("reload is in backoff until {retry_after:?}")]
    ReloadBackoff { retry_after: Duration },
    #[error("reload queue is full")]
    ReloadQueueFull,
}

struct ReloadTarget {
    reloadable: Arc<dyn ReloadableModule>,
    dynamic_fields: HashSet<String>,
    timeout: Duration,
}

struct BackoffState {
    failure_count: u32,
    next_allowed_at: Instant,
    rejection_log: ThrottledLog,
}

/// Coordinates dynamic config reload across every registered module.
pub struct ReloadOrchestrator {
    /// Registration order matters: a sweep reloads modules in the order they
    /// were registered, so a re-registration under an already-known name
    /// replaces the entry in place rather than moving it to the end.
    targets: RwLock<Vec<(String, ReloadTarget)>>,
    backoff: RwLock<Option<BackoffState>>,
    flight: tokio::sync::Mutex<()>,
    pending: AtomicUsize,
    queue_capacity: usize,
    observers: Arc<ObserverSubject>,
}

impl ReloadOrchestrator {
    #[must_use]
    pub fn new(observers: Arc<ObserverSubject>) -> Self {
        Self::with_capacity(observers, DEFAULT_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(observers: Arc<ObserverSubject>, queue_capacity: usize) -> Self {
        Self {
            targets: RwLock::new(Vec::new()),
            backoff: RwLock::new(None),
            flight: tokio::sync::Mutex::new(()),
            pending: AtomicUsize::new(0),
            queue_capacity,
            observers,
        }
    }

    pub fn register(
        &self,
        module: impl Into<String>,
        reloadable: Arc<dyn ReloadableModule>,
        dynamic_fields: HashSet<String>,
        timeout: Duration,
    ) {
        let module = module.into();
        let target = ReloadTarget { reloadable, dynamic_fields, timeout };
        let mut targets = self.targets.write();
        if let Some(existing) = targets.iter_mut().find(|(name, _)| *name == module) {
            existing.1 = target;
        } else {
            targets.push((module, target));
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let backoff = self.backoff.read();
        backoff.as_ref().and_then(|state| {
            let now = Instant::now();
            let remaining = (state.next_allowed_at > now).then(|| state.next_allowed_at - now)?;
            if state.rejection_log.should_log() {
                tracing::warn!(retry_after = %humantime::format_duration(remaining), "reload rejected, still in backoff");
            }
            Some(remaining)
        })
    }

    fn record_failure(&self) {
        let mut backoff = self.backoff.write();
        let state = backoff.get_or_insert_with(|| BackoffState {
            failure_count: 0,
            next_allowed_at: Instant::now(),
            rejection_log: ThrottledLog::new(DEFAULT_BACKOFF_LOG_INTERVAL),
        });
        state.failure_count += 1;
        let delay = BACKOFF_BASE
            .saturating_mul(1u32.checked_shl(state.failure_count.saturating_sub(1)).unwrap_or(u32::MAX))
            .min(BACKOFF_CAP);
        state.next_allowed_at = Instant::now() + delay;
    }

    fn record_success(&self) {
        *self.backoff.write() = None;
    }

    /// Emit `event`, logging (not propagating) an envelope-validation failure.
    /// Every event built in this module uses a fixed, well-formed source/type,
    /// so rejection here would indicate a programmer error, not bad input.
    async fn notify(&self, event: Event) {
        if let Err(err) = self.observers.emit(event).await {
            tracing::warn!(error = %err, "reload event rejected");
        }
    }

    /// Sweep every registered module, in registration order, applying
    /// whichever part of `changes` each module declared as dynamic.
    ///
    /// Aborts on the first module that errors or times out: no module after
    /// it runs, and no `completed` event is published for the sweep, only a
    /// `failed` one. `trigger` identifies what caused the reload (e.g. a file
    /// watch or an admin request) and is carried on the `started` event.
    ///
    /// # Errors
    /// Returns [`ReloadError::ReloadQueueFull`] if the bounded wait queue is
    /// already at capacity, or [`ReloadError::ReloadBackoff`] if the
    /// orchestrator is still within its post-failure backoff window.
    pub async fn request_reload(
        &self,
        ctx: &ModuleCtx,
        trigger: impl Into<String>,
        changes: ReloadChanges,
    ) -> Result<ReloadState, ReloadError> {
        if let Some(remaining) = self.backoff_remaining() {
            return Err(ReloadError::ReloadBackoff { retry_after: remaining });
        }

        let pending_now = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending_now > self.queue_capacity {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ReloadError::ReloadQueueFull);
        }

        let _flight_guard = self.flight.lock().await;
        self.pending.fetch_sub(1, Ordering::SeqCst);

        let reload_id = Uuid::now_v7().to_string();
        let trigger = trigger.into();
        let started_at = Instant::now();

        self.notify(Event::new(
            "reload-orchestrator",
            EVENT_CONFIG_RELOAD_STARTED,
            serde_json::json!({ "reload_id": reload_id, "trigger": trigger }),
        ))
        .await;

        let sweep = {
            let targets = self.targets.read();
            targets
                .iter()
                .map(|(name, target)| (name.clone(), target.reloadable.clone(), target.dynamic_fields.clone(), target.timeout))
                .collect::<Vec<_>>()
        };

        let mut affected = Vec::new();
        for (name, reloadable, dynamic_fields, timeout) in sweep {
            if !changes.intersects(&dynamic_fields) {
                continue;
            }

            let result = tokio::time::timeout(timeout, reloadable.reload(ctx, &changes)).await;
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_elapsed) => Some("timed out".to_owned()),
            };

            if let Some(error) = failure {
                self.record_failure();
                let duration_ms = started_at.elapsed().as_millis();
                self.notify(Event::new(
                    "reload-orchestrator",
                    EVENT_CONFIG_RELOAD_FAILED,
                    serde_json::json!({
                        "reload_id": reload_id,
                        "module": name,
                        "duration_ms": duration_ms,
                        "error": error,
                    }),
                ))
                .await;
                tracing::warn!(module = %name, error = %error, "module reload failed");
                return Ok(ReloadState::Failed);
            }

            affected.push(name);
        }

        let duration_ms = started_at.elapsed().as_millis();
        if affected.is_empty() {
            self.notify(Event::new(
                "reload-orchestrator",
                EVENT_CONFIG_RELOAD_NOOP,
                serde_json::json!({ "reload_id": reload_id, "duration_ms": duration_ms }),
            ))
            .await;
            return Ok(ReloadState::Noop);
        }

        self.record_success();
        self.notify(Event::new(
            "reload-orchestrator",
            EVENT_CONFIG_RELOAD_COMPLETED,
            serde_json::json!({
                "reload_id": reload_id,
                "duration_ms": duration_ms,
                "changes_applied": affected.len(),
                "affected_modules": affected,
            }),
        ))
        .await;
        Ok(ReloadState::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct SucceedingModule;
    #[async_trait]
    impl ReloadableModule for SucceedingModule {
        async fn reload(&self, _ctx: &ModuleCtx, _changes: &ReloadChanges) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingModule {
        attempts: Arc<AtomicU32>,
    }
    #[async_trait]
    impl ReloadableModule for FailingModule {
        async fn reload(&self, _ctx: &ModuleCtx, _changes: &ReloadChanges) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("reload rejected"))
        }
    }

    fn test_ctx() -> ModuleCtx {
        crate::context::ModuleCtx::for_tests("test-module")
    }

    #[tokio::test]
    async fn unchanged_fields_outside_dynamic_set_is_noop() {
        let observers = Arc::new(ObserverSubject::new());
        let orchestrator = ReloadOrchestrator::new(observers);
        orchestrator.register("m", Arc::new(SucceedingModule), HashSet::from(["port".to_owned()]), DEFAULT_MODULE_TIMEOUT);

        let mut changes = ReloadChanges::default();
        changes.changed_fields.insert("unrelated".to_owned(), (Value::Null, Value::Null));

        let state = orchestrator.request_reload(&test_ctx(), "manual", changes).await.unwrap();
        assert_eq!(state, ReloadState::Noop);
    }

    #[tokio::test]
    async fn successful_reload_resets_backoff() {
        let observers = Arc::new(ObserverSubject::new());
        let orchestrator = ReloadOrchestrator::new(observers);
        orchestrator.register("m", Arc::new(SucceedingModule), HashSet::new(), DEFAULT_MODULE_TIMEOUT);

        let mut changes = ReloadChanges::default();
        changes.changed_fields.insert("port".to_owned(), (Value::Null, Value::Null));

        let state = orchestrator.request_reload(&test_ctx(), "manual", changes).await.unwrap();
        assert_eq!(state, ReloadState::Succeeded);
        assert!(orchestrator.backoff_remaining().is_none());
    }

    #[tokio::test]
    async fn sweep_runs_modules_in_registration_order() {
        let observers = Arc::new(ObserverSubject::new());
        let orchestrator = ReloadOrchestrator::new(observers);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct OrderRecordingModule {
            name: &'static str,
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        }
        #[async_trait]
        impl ReloadableModule for OrderRecordingModule {
            async fn reload(&self, _ctx: &ModuleCtx, _changes: &ReloadChanges) -> anyhow::Result<()> {
                self.order.lock().unwrap().push(self.name);
                Ok(())
            }
        }

        orchestrator.register(
            "first",
            Arc::new(OrderRecordingModule { name: "first", order: order.clone() }),
            HashSet::new(),
            DEFAULT_MODULE_TIMEOUT,
        );
        orchestrator.register(
            "second",
            Arc::new(OrderRecordingModule { name: "second", order: order.clone() }),
            HashSet::new(),
            DEFAULT_MODULE_TIMEOUT,
        );

        let mut changes = ReloadChanges::default();
        changes.changed_fields.insert("port".to_owned(), (Value::Null, Value::Null));

        let state = orchestrator.request_reload(&test_ctx(), "manual", changes).await.unwrap();
        assert_eq!(state, ReloadState::Succeeded);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failed_reload_enters_backoff_and_aborts_remaining_modules() {
        let observers = Arc::new(ObserverSubject::new());
        let orchestrator = ReloadOrchestrator::new(observers);
        let attempts = Arc::new(AtomicU32::new(0));
        let later_attempts = Arc::new(AtomicU32::new(0));
        orchestrator.register("failing", Arc::new(FailingModule { attempts: attempts.clone() }), HashSet::new(), DEFAULT_MODULE_TIMEOUT);
        orchestrator.register(
            "later",
            Arc::new(FailingModule { attempts: later_attempts.clone() }),
            HashSet::new(),
            DEFAULT_MODULE_TIMEOUT,
        );

        let mut changes = ReloadChanges::default();
        changes.changed_fields.insert("port".to_owned(), (Value::Null, Value::Null));

        let state = orchestrator.request_reload(&test_ctx(), "manual", changes.clone()).await.unwrap();
        assert_eq!(state, ReloadState::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(later_attempts.load(Ordering::SeqCst), 0, "module after the failing one must not run");

        let err = orchestrator.request_reload(&test_ctx(), "manual", changes.clone()).await.unwrap_err();
        assert!(matches!(err, ReloadError::ReloadBackoff { .. }));

        // A second rejection while still in backoff exercises the throttled
        // "still in backoff" log path without tripping it twice in a row.
        let err = orchestrator.request_reload(&test_ctx(), "manual", changes).await.unwrap_err();
        assert!(matches!(err, ReloadError::ReloadBackoff { .. }));
    }

    #[tokio::test]
    async fn sweep_with_no_registered_modules_is_noop() {
        let observers = Arc::new(ObserverSubject::new());
        let orchestrator = ReloadOrchestrator::new(observers);
        let state = orchestrator.request_reload(&test_ctx(), "manual", ReloadChanges::default()).await.unwrap();
        assert_eq!(state, ReloadState::Noop);
    }
}
