//! Drives modules through `Registered → Configured → Initialized → Started →
//! Stopped`, in the resolved order handed down by [`crate::registry`].
//!
//! Service resolution is lazy: the orchestrator never looks up a required
//! service's type on a module's behalf (see [`crate::context`] for why), it
//! only calls `init`/`start`/`stop` in the right order and turns failures into
//! `module.failed` events plus a best-effort reverse rollback.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::ModuleContextBuilder;
use crate::observer::{
    Event, ObserverSubject, EVENT_APPLICATION_FAILED, EVENT_APPLICATION_STARTED, EVENT_APPLICATION_STOPPED,
    EVENT_MODULE_FAILED, EVENT_MODULE_INITIALIZED, EVENT_MODULE_REGISTERED, EVENT_MODULE_STARTED, EVENT_MODULE_STOPPED,
};
use crate::registry::{ModuleEntry, ModuleRegistry};

const EVENT_SOURCE: &str = "modkit.lifecycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Init,
    Start,
    Stop,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("module '{module}' failed during {phase}: {source}")]
    ModuleFailed { module: &'static str, phase: LifecyclePhase, #[source] source: anyhow::Error },
    #[error("illegal lifecycle transition for module '{module}': {from} -> {to}")]
    IllegalTransition { module: &'static str, from: &'static str, to: &'static str },
    #[error("{0} module(s) failed to stop cleanly")]
    StopFailures(usize),
}

/// Per-module lifecycle state, tracked only to catch programmer error
/// (double-init, stop-before-start, etc.) — modules themselves stay stateless
/// of this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Registered,
    Configured,
    Initialized,
    Started,
    Stopped,
}

impl ModuleState {
    const fn label(self) -> &'static str {
        match self {
            Self::Registered => "Registered",
            Self::Configured => "Configured",
            Self::Initialized => "Initialized",
            Self::Started => "Started",
            Self::Stopped => "Stopped",
        }
    }

    /// Whether advancing from `self` to `next` is a legal forward step.
    const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Registered, Self::Configured)
                | (Self::Configured, Self::Initialized)
                | (Self::Initialized, Self::Started)
                | (Self::Started, Self::Stopped)
        )
    }
}

/// Walks a resolved [`ModuleRegistry`] through init, start, and stop.
pub struct LifecycleOrchestrator {
    registry: ModuleRegistry,
    ctx_builder: ModuleContextBuilder,
    observers: Arc<ObserverSubject>,
    cancel: CancellationToken,
    states: parking_lot::RwLock<std::collections::HashMap<&'static str, ModuleState>>,
}

impl LifecycleOrchestrator {
    #[must_use]
    pub fn new(
        registry: ModuleRegistry,
        ctx_builder: ModuleContextBuilder,
        observers: Arc<ObserverSubject>,
        cancel: CancellationToken,
    ) -> Self {
        let states = registry.modules().iter().map(|e| (e.name, ModuleState::Registered)).collect();
        Self { registry, ctx_builder, observers, cancel, states: parking_lot::RwLock::new(states) }
    }

    fn transition(&self, module: &'static str, next: ModuleState) -> Result<(), LifecycleError> {
        let mut states = self.states.write();
        let current = *states.get(module).unwrap_or(&ModuleState::Registered);
        if !current.can_advance_to(next) {
            return Err(LifecycleError::IllegalTransition {
                module,
                from: current.label(),
                to: next.label(),
            });
        }
        states.insert(module, next);
        Ok(())
    }

    #[must_use]
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Emit `event`, logging (not propagating) an envelope-validation failure.
    /// Every event built in this module uses a fixed, well-formed source/type,
    /// so rejection here would indicate a programmer error, not bad input.
    async fn notify(&self, event: Event) {
        if let Err(err) = self.observers.emit(event).await {
            tracing::warn!(error = %err, "lifecycle event rejected");
        }
    }

    /// Run the init sequence over every module, in resolved order.
    ///
    /// A module enters `Configured` before `init` runs (config materialization
    /// happens lazily the first time `ModuleCtx::config()` is called, so this
    /// step is a state-machine formality rather than extra work) and
    /// `Initialized` once `init` returns `Ok`.
    ///
    /// # Errors
    /// Returns [`LifecycleError::ModuleFailed`] tagged with [`LifecyclePhase::Init`]
    /// on the first module whose `init` hook errors; no later modules are
    /// initialized.
    pub async fn init_all(&self) -> Result<(), LifecycleError> {
        for entry in self.registry.modules() {
            self.transition(entry.name, ModuleState::Configured)?;

            let ctx = self.ctx_builder.for_module(entry.name);

            if let Err(source) = entry.core.init(&ctx).await {
                self.emit_failed(entry.name, LifecyclePhase::Init, &source).await;
                return Err(LifecycleError::ModuleFailed { module: entry.name, phase: LifecyclePhase::Init, source });
            }

            self.transition(entry.name, ModuleState::Initialized)?;
            self.notify(Event::new(EVENT_SOURCE, EVENT_MODULE_INITIALIZED, json!({ "module": entry.name }))).await;
            self.notify(Event::new(EVENT_SOURCE, EVENT_MODULE_REGISTERED, json!({ "module": entry.name }))).await;
        }
        Ok(())
    }

    /// Start every stateful module in resolved (forward) order.
    ///
    /// On failure, already-started modules are stopped in reverse order on a
    /// best-effort basis before the error is returned; stop failures during
    /// this rollback are logged, not propagated (rollback must not itself
    /// abort).
    ///
    /// # Errors
    /// Returns [`LifecycleError::ModuleFailed`] tagged with [`LifecyclePhase::Start`].
    pub async fn start_all(&self) -> Result<(), LifecycleError> {
        let mut started: Vec<&ModuleEntry> = Vec::new();

        for entry in self.registry.modules() {
            let Some(stateful) = &entry.stateful else {
                self.transition(entry.name, ModuleState::Started)?;
                continue;
            };

            if let Err(source) = stateful.start(self.cancel.clone()).await {
                self.emit_failed(entry.name, LifecyclePhase::Start, &source).await;

                for prev in started.iter().rev() {
                    Self::stop_one(prev, self.cancel.clone()).await;
                }

                return Err(LifecycleError::ModuleFailed { module: entry.name, phase: LifecyclePhase::Start, source });
            }

            self.transition(entry.name, ModuleState::Started)?;
            self.notify(Event::new(EVENT_SOURCE, EVENT_MODULE_STARTED, json!({ "module": entry.name }))).await;
            started.push(entry);
        }

        Ok(())
    }

    /// Stop every module in reverse order. Errors are logged per module and
    /// collected; the sweep always runs to completion.
    ///
    /// # Errors
    /// Returns [`LifecycleError::StopFailures`] with the failure count if any
    /// module's `stop` hook errored.
    pub async fn stop_all(&self) -> Result<(), LifecycleError> {
        let mut failures = 0usize;
        for entry in self.registry.modules().iter().rev() {
            if !Self::stop_one(entry, self.cancel.clone()).await {
                failures += 1;
            }
            let _ = self.transition(entry.name, ModuleState::Stopped);
            self.notify(Event::new(EVENT_SOURCE, EVENT_MODULE_STOPPED, json!({ "module": entry.name }))).await;
        }

        if failures > 0 {
            return Err(LifecycleError::StopFailures(failures));
        }
        Ok(())
    }

    /// Stop a single module, logging errors but continuing. Returns whether
    /// the stop succeeded.
    async fn stop_one(entry: &ModuleEntry, cancel: CancellationToken) -> bool {
        let Some(stateful) = &entry.stateful else { return true };
        match stateful.stop(cancel).await {
            Ok(()) => {
                tracing::info!(module = entry.name, "module stopped");
                true
            }
            Err(err) => {
                tracing::warn!(module = entry.name, error = %err, "module failed to stop cleanly");
                false
            }
        }
    }

    async fn emit_failed(&self, module: &'static str, phase: LifecyclePhase, source: &anyhow::Error) {
        self.notify(Event::new(
            EVENT_SOURCE,
            EVENT_MODULE_FAILED,
            json!({ "module": module, "phase": phase.to_string(), "cause": source.to_string() }),
        ))
        .await;
    }

    /// Run init, then start, then wait for the root cancellation token, then
    /// stop. The usual entry point for a process that owns its own lifetime.
    ///
    /// Emits `application.started` once init and start both succeed,
    /// `application.failed` if either phase errors, and `application.stopped`
    /// once the stop sweep completes (regardless of per-module stop failures).
    ///
    /// # Errors
    /// Propagates [`LifecycleError`] from any phase.
    pub async fn run(&self) -> Result<(), LifecycleError> {
        if let Err(err) = self.init_all().await {
            self.notify(Event::new(EVENT_SOURCE, EVENT_APPLICATION_FAILED, json!({ "phase": "init", "cause": err.to_string() })))
                .await;
            return Err(err);
        }

        if let Err(err) = self.start_all().await {
            self.notify(Event::new(EVENT_SOURCE, EVENT_APPLICATION_FAILED, json!({ "phase": "start", "cause": err.to_string() })))
                .await;
            return Err(err);
        }

        self.notify(Event::new(EVENT_SOURCE, EVENT_APPLICATION_STARTED, json!({}))).await;

        self.cancel.cancelled().await;
        let stop_result = self.stop_all().await;
        self.notify(Event::new(EVENT_SOURCE, EVENT_APPLICATION_STOPPED, json!({}))).await;
        stop_result
    }
}
