//! CloudEvents-shaped lifecycle/domain event distribution.
//!
//! Observers register for a set of event types (empty = all) and a dispatch
//! mode. Synchronous observers are invoked inline, in registration order,
//! before `emit` returns; asynchronous observers are fanned out onto the
//! runtime and their errors are logged, never propagated back to the emitter.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const EVENT_MODULE_REGISTERED: &str = "module.registered";
pub const EVENT_MODULE_INITIALIZED: &str = "module.initialized";
pub const EVENT_MODULE_STARTED: &str = "module.started";
pub const EVENT_MODULE_STOPPED: &str = "module.stopped";
pub const EVENT_MODULE_FAILED: &str = "module.failed";
pub const EVENT_APPLICATION_STARTED: &str = "application.started";
pub const EVENT_APPLICATION_STOPPED: &str = "application.stopped";
pub const EVENT_APPLICATION_FAILED: &str = "application.failed";
pub const EVENT_SERVICE_REGISTERED: &str = "service.registered";
pub const EVENT_CONFIG_LOADED: &str = "config.loaded";
pub const EVENT_CONFIG_VALIDATED: &str = "config.validated";
pub const EVENT_CONFIG_RELOAD_STARTED: &str = "config.reload.started";
pub const EVENT_CONFIG_RELOAD_COMPLETED: &str = "config.reload.completed";
pub const EVENT_CONFIG_RELOAD_FAILED: &str = "config.reload.failed";
pub const EVENT_CONFIG_RELOAD_NOOP: &str = "config.reload.noop";
pub const EVENT_HEALTH_EVALUATED: &str = "health.evaluated";

/// Extension attribute names must match this pattern (CloudEvents v1.0
/// extension-attribute naming convention, restricted further to
/// `[a-z0-9]{1,20}`): lowercase letters and digits only, no hyphens or
/// underscores, 1 to 20 characters.
fn is_valid_extension_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 20 && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// A CloudEvents v1.0-shaped envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Event {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub specversion: &'static str,
    pub time: String,
    pub data: Value,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, String>,
}

impl Event {
    #[must_use]
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            specversion: "1.0",
            time: humantime::format_rfc3339(std::time::SystemTime::now()).to_string(),
            data,
            extensions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }
}

/// One lifecycle/domain event sink.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_event(&self, event: &Event);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("observer '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("observer '{0}' is not registered")]
    NotRegistered(String),
    #[error("malformed event envelope: {reason}")]
    MalformedEnvelope { reason: String },
}

struct Registration {
    name: String,
    observer: std::sync::Arc<dyn Observer>,
    event_types: Vec<String>,
    mode: DispatchMode,
}

tokio::task_local! {
    static FORCE_SYNC_DISPATCH: bool;
}

/// Distributes [`Event`]s to registered [`Observer`]s.
#[derive(Default)]
pub struct ObserverSubject {
    registrations: RwLock<Vec<Registration>>,
}

impl ObserverSubject {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` with all dispatch forced synchronous regardless of each
    /// observer's registered mode. Used when draining observers during
    /// shutdown, where delivery order must be deterministic.
    pub async fn with_synchronous_dispatch<F, Fut, T>(body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        FORCE_SYNC_DISPATCH.scope(true, body()).await
    }

    /// # Errors
    /// Returns [`ObserverError::AlreadyRegistered`] if `name` is already registered.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        observer: std::sync::Arc<dyn Observer>,
        event_types: Vec<String>,
        mode: DispatchMode,
    ) -> Result<(), ObserverError> {
        let name = name.into();
        let mut registrations = self.registrations.write();
        if registrations.iter().any(|r| r.name == name) {
            return Err(ObserverError::AlreadyRegistered(name));
        }
        registrations.push(Registration { name, observer, event_types, mode });
        Ok(())
    }

    /// # Errors
    /// Returns [`ObserverError::NotRegistered`] if `name` was never registered.
    pub fn unsubscribe(&self, name: &str) -> Result<(), ObserverError> {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.name != name);
        if registrations.len() == before {
            return Err(ObserverError::NotRegistered(name.to_owned()));
        }
        Ok(())
    }

    /// Validate `event`'s envelope and dispatch it to matching observers.
    ///
    /// # Errors
    /// Returns [`ObserverError::MalformedEnvelope`] if `specversion` isn't
    /// `"1.0"`, `source`/`type` are empty, or an extension attribute name
    /// doesn't match `[a-z0-9]{1,20}`. A rejected event is never dispatched.
    pub async fn emit(&self, event: Event) -> Result<(), ObserverError> {
        Self::validate_envelope(&event)?;

        let force_sync = FORCE_SYNC_DISPATCH.try_with(|v| *v).unwrap_or(false);
        let matching: Vec<(std::sync::Arc<dyn Observer>, DispatchMode, String)> = {
            let registrations = self.registrations.read();
            registrations
                .iter()
                .filter(|r| r.event_types.is_empty() || r.event_types.iter().any(|t| t == &event.event_type))
                .map(|r| (r.observer.clone(), r.mode, r.name.clone()))
                .collect()
        };

        for (observer, mode, name) in matching {
            let effective_mode = if force_sync { DispatchMode::Sync } else { mode };
            match effective_mode {
                DispatchMode::Sync => {
                    Self::dispatch_one(&observer, &event, &name).await;
                }
                DispatchMode::Async => {
                    let event = event.clone();
                    tokio::spawn(async move {
                        Self::dispatch_one(&observer, &event, &name).await;
                    });
                }
            }
        }

        Ok(())
    }

    fn validate_envelope(event: &Event) -> Result<(), ObserverError> {
        if event.specversion != "1.0" {
            return Err(ObserverError::MalformedEnvelope {
                reason: format!("unsupported specversion '{}'", event.specversion),
            });
        }
        if event.source.is_empty() {
            return Err(ObserverError::MalformedEnvelope { reason: "source must not be empty".to_owned() });
        }
        if event.event_type.is_empty() {
            return Err(ObserverError::MalformedEnvelope { reason: "type must not be empty".to_owned() });
        }
        for key in event.extensions.keys() {
            if !is_valid_extension_name(key) {
                return Err(ObserverError::MalformedEnvelope {
                    reason: format!("extension attribute name '{key}' must match [a-z0-9]{{1,20}}"),
                });
            }
        }
        Ok(())
    }

    async fn dispatch_one(observer: &std::sync::Arc<dyn Observer>, event: &Event, name: &str) {
        let result = AssertUnwindSafe(observer.on_event(event)).catch_unwind().await;
        if let Err(panic) = result {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            tracing::error!(observer = name, event_type = %event.event_type, panic = %message, "observer panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingObserver {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Observer for CountingObserver {
        async fn on_event(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingObserver;

    #[async_trait]
    impl Observer for PanickingObserver {
        async fn on_event(&self, _event: &Event) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn sync_dispatch_completes_before_emit_returns() {
        let subject = ObserverSubject::new();
        let count = Arc::new(AtomicUsize::new(0));
        subject
            .subscribe("counter", Arc::new(CountingObserver { count: count.clone() }), vec![], DispatchMode::Sync)
            .unwrap();

        subject.emit(Event::new("test", EVENT_MODULE_STARTED, Value::Null)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn event_type_filter_excludes_non_matching_events() {
        let subject = ObserverSubject::new();
        let count = Arc::new(AtomicUsize::new(0));
        subject
            .subscribe(
                "counter",
                Arc::new(CountingObserver { count: count.clone() }),
                vec![EVENT_MODULE_STARTED.to_owned()],
                DispatchMode::Sync,
            )
            .unwrap();

        subject.emit(Event::new("test", EVENT_MODULE_STOPPED, Value::Null)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_observer_is_isolated() {
        let subject = ObserverSubject::new();
        let count = Arc::new(AtomicUsize::new(0));
        subject.subscribe("panicker", Arc::new(PanickingObserver), vec![], DispatchMode::Sync).unwrap();
        subject
            .subscribe("counter", Arc::new(CountingObserver { count: count.clone() }), vec![], DispatchMode::Sync)
            .unwrap();

        subject.emit(Event::new("test", EVENT_MODULE_STARTED, Value::Null)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_subscription_name_is_rejected() {
        let subject = ObserverSubject::new();
        let count = Arc::new(AtomicUsize::new(0));
        subject
            .subscribe("counter", Arc::new(CountingObserver { count: count.clone() }), vec![], DispatchMode::Sync)
            .unwrap();
        let err = subject
            .subscribe("counter", Arc::new(CountingObserver { count }), vec![], DispatchMode::Sync)
            .unwrap_err();
        assert!(matches!(err, ObserverError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn malformed_specversion_is_rejected() {
        let subject = ObserverSubject::new();
        let mut event = Event::new("test", EVENT_MODULE_STARTED, Value::Null);
        event.specversion = "0.3";
        let err = subject.emit(event).await.unwrap_err();
        assert!(matches!(err, ObserverError::MalformedEnvelope { .. }));
    }

    #[tokio::test]
    async fn invalid_extension_name_is_rejected() {
        let subject = ObserverSubject::new();
        let event = Event::new("test", EVENT_MODULE_STARTED, Value::Null).with_extension("module-action", "start");
        let err = subject.emit(event).await.unwrap_err();
        assert!(matches!(err, ObserverError::MalformedEnvelope { .. }));
    }

    #[tokio::test]
    async fn valid_extension_name_is_accepted() {
        let subject = ObserverSubject::new();
        let event = Event::new("test", EVENT_MODULE_STARTED, Value::Null).with_extension("moduleaction", "start");
        subject.emit(event).await.unwrap();
    }
}
