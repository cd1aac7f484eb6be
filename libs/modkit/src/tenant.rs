//! Per-tenant configuration overlays and tenant-registration notifications.
//!
//! Tenant overlays live under `<root>/tenants/<tenantId>.<ext>` (one of
//! `yaml`, `yml`, `json`, `toml`) and are loaded into a `(tenant, section)`
//! keyed overlay map rather than merged into the base config, so a module can
//! ask for "my section, for this tenant" without the base config ever seeing
//! tenant-specific values.
//!
//! Tenant-aware modules may receive a registration notification before their
//! own `init` has returned. Rather than guard every handler with a nil-check
//! on some "am I ready yet" field, readiness is an explicit two-state machine
//! ([`ModuleReadiness`]) the module flips once; the registry queues
//! notifications for not-yet-ready subscribers and replays them on flip.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use figment::providers::{Format, Json, Toml, Yaml};
use figment::Figment;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// A tenant identifier. Cheap to clone, hashable, used as half of the overlay
/// key and as the notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(Arc<str>);

impl TenantId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant overlay file '{path}' has an unrecognized extension (want yaml/yml/json/toml)")]
    UnrecognizedExtension { path: PathBuf },
    #[error("failed to load tenant overlay '{path}': {source}")]
    LoadFailed { path: PathBuf, #[source] source: figment::Error },
    #[error("tenant overlay directory '{path}' could not be read: {source}")]
    DirectoryUnreadable { path: PathBuf, #[source] source: std::io::Error },
    #[error("observer '{0}' is already subscribed to tenant notifications")]
    AlreadySubscribed(String),
}

/// Whether a tenant-aware module is ready to receive notifications yet. A
/// module starts `Initializing` and flips to `Ready` itself, once, typically
/// at the end of its own `init`.
#[derive(Default)]
pub struct ModuleReadiness(AtomicBool);

impl ModuleReadiness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A module that wants to know when a tenant is registered.
#[async_trait]
pub trait TenantAwareModule: Send + Sync {
    async fn on_tenant_registered(&self, tenant: &TenantId);
}

struct Subscriber {
    name: String,
    module: Arc<dyn TenantAwareModule>,
    readiness: Arc<ModuleReadiness>,
    pending: Vec<TenantId>,
}

/// Holds per-tenant config overlays and drives tenant-registration
/// notifications out to subscribed modules.
pub struct TenantRegistry {
    overlays: RwLock<HashMap<(TenantId, String), Value>>,
    tenants: RwLock<Vec<TenantId>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { overlays: RwLock::new(HashMap::new()), tenants: RwLock::new(Vec::new()), subscribers: RwLock::new(Vec::new()) }
    }

    /// Register a tenant-aware module. `readiness` is shared with the module
    /// so it can flip it itself; until it does, notifications accumulate in a
    /// per-subscriber pending queue instead of being delivered.
    ///
    /// # Errors
    /// Returns [`TenantError::AlreadySubscribed`] if `name` is already registered.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        module: Arc<dyn TenantAwareModule>,
        readiness: Arc<ModuleReadiness>,
    ) -> Result<(), TenantError> {
        let name = name.into();
        let mut subscribers = self.subscribers.write();
        if subscribers.iter().any(|s| s.name == name) {
            return Err(TenantError::AlreadySubscribed(name));
        }
        subscribers.push(Subscriber { name, module, readiness, pending: Vec::new() });
        Ok(())
    }

    /// Register a tenant and notify every subscriber that is currently ready;
    /// not-yet-ready subscribers have the tenant queued for later delivery via
    /// [`Self::drain_pending`].
    pub async fn register_tenant(&self, tenant: TenantId) {
        self.tenants.write().push(tenant.clone());

        let mut to_notify = Vec::new();
        {
            let mut subscribers = self.subscribers.write();
            for sub in subscribers.iter_mut() {
                if sub.readiness.is_ready() {
                    to_notify.push(sub.module.clone());
                } else {
                    sub.pending.push(tenant.clone());
                }
            }
        }

        for module in to_notify {
            module.on_tenant_registered(&tenant).await;
        }
    }

    /// Replay any tenant registrations a subscriber missed while it was not
    /// yet ready. A module should call this right after it calls
    /// [`ModuleReadiness::mark_ready`] on the handle it was given at
    /// subscription time.
    pub async fn drain_pending(&self, name: &str) {
        let (module, pending) = {
            let mut subscribers = self.subscribers.write();
            let Some(sub) = subscribers.iter_mut().find(|s| s.name == name) else { return };
            (sub.module.clone(), std::mem::take(&mut sub.pending))
        };
        for tenant in pending {
            module.on_tenant_registered(&tenant).await;
        }
    }

    /// Load every `<root>/tenants/<tenantId>.<ext>` overlay file, splitting
    /// each document's top-level keys into `(tenant, section)` overlay
    /// entries rather than merging them into one tenant-wide blob.
    ///
    /// # Errors
    /// Returns [`TenantError::DirectoryUnreadable`] if `tenants_dir` can't be
    /// listed, [`TenantError::UnrecognizedExtension`] for a file whose
    /// extension isn't one of yaml/yml/json/toml, or
    /// [`TenantError::LoadFailed`] if a file fails to parse.
    ///
    /// # Panics
    /// Never in practice: the filename regex is a fixed literal, and the
    /// extension match is exhaustive over what that regex can capture.
    pub fn load_overlays_from_dir(&self, tenants_dir: &Path) -> Result<Vec<TenantId>, TenantError> {
        static TENANT_FILE: std::sync::LazyLock<Regex> =
            std::sync::LazyLock::new(|| Regex::new(r"^(?P<id>[^.]+)\.(?P<ext>yaml|yml|json|toml)$").unwrap_or_else(|e| unreachable!("static regex is valid: {e}")));
        let mut loaded = Vec::new();

        let entries = std::fs::read_dir(tenants_dir)
            .map_err(|source| TenantError::DirectoryUnreadable { path: tenants_dir.to_path_buf(), source })?;

        for entry in entries {
            let entry = entry.map_err(|source| TenantError::DirectoryUnreadable { path: tenants_dir.to_path_buf(), source })?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let Some(captures) = TENANT_FILE.captures(file_name) else {
                return Err(TenantError::UnrecognizedExtension { path });
            };

            let tenant = TenantId::new(captures["id"].to_owned());
            let ext = &captures["ext"];

            let figment = match ext {
                "yaml" | "yml" => Figment::new().merge(Yaml::file(&path)),
                "json" => Figment::new().merge(Json::file(&path)),
                "toml" => Figment::new().merge(Toml::file(&path)),
                _ => unreachable!("regex only matches known extensions"),
            };

            let doc: Value = figment.extract().map_err(|source| TenantError::LoadFailed { path: path.clone(), source })?;

            if let Value::Object(sections) = doc {
                let mut overlays = self.overlays.write();
                for (section, value) in sections {
                    overlays.insert((tenant.clone(), section), value);
                }
            }

            loaded.push(tenant);
        }

        Ok(loaded)
    }

    /// Fetch the overlay for `(tenant, section)`, if one was loaded.
    #[must_use]
    pub fn overlay(&self, tenant: &TenantId, section: &str) -> Option<Value> {
        self.overlays.read().get(&(tenant.clone(), section.to_owned())).cloned()
    }

    #[must_use]
    pub fn tenants(&self) -> Vec<TenantId> {
        self.tenants.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingModule {
        seen: Arc<RwLock<Vec<TenantId>>>,
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TenantAwareModule for RecordingModule {
        async fn on_tenant_registered(&self, tenant: &TenantId) {
            self.seen.write().push(tenant.clone());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ready_subscriber_is_notified_immediately() {
        let registry = TenantRegistry::new();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let readiness = Arc::new(ModuleReadiness::new());
        readiness.mark_ready();

        registry
            .subscribe("billing", Arc::new(RecordingModule { seen: seen.clone(), count: count.clone() }), readiness)
            .unwrap();

        registry.register_tenant(TenantId::new("acme")).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(seen.read()[0], TenantId::new("acme"));
    }

    #[tokio::test]
    async fn not_ready_subscriber_queues_and_replays_on_drain() {
        let registry = TenantRegistry::new();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let readiness = Arc::new(ModuleReadiness::new());

        registry
            .subscribe("billing", Arc::new(RecordingModule { seen: seen.clone(), count: count.clone() }), readiness.clone())
            .unwrap();

        registry.register_tenant(TenantId::new("acme")).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "not-ready module should not be notified yet");

        readiness.mark_ready();
        registry.drain_pending("billing").await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(seen.read()[0], TenantId::new("acme"));
    }

    #[test]
    fn duplicate_subscription_name_is_rejected() {
        let registry = TenantRegistry::new();
        let readiness = Arc::new(ModuleReadiness::new());
        let module = Arc::new(RecordingModule { seen: Arc::new(RwLock::new(Vec::new())), count: Arc::new(AtomicUsize::new(0)) });

        registry.subscribe("billing", module.clone(), readiness.clone()).unwrap();
        let err = registry.subscribe("billing", module, readiness).unwrap_err();
        assert!(matches!(err, TenantError::AlreadySubscribed(_)));
    }

    #[test]
    fn loading_overlays_splits_by_section_and_rejects_bad_extensions() {
        let dir = tempfile_dir();
        std::fs::write(dir.join("acme.yaml"), "db:\n  host: acme-host\ncache:\n  ttl: 30\n").unwrap();
        std::fs::write(dir.join("globex.json"), r#"{"db": {"host": "globex-host"}}"#).unwrap();

        let registry = TenantRegistry::new();
        let loaded = registry.load_overlays_from_dir(&dir).unwrap();
        assert_eq!(loaded.len(), 2);

        let acme_db = registry.overlay(&TenantId::new("acme"), "db").unwrap();
        assert_eq!(acme_db["host"], "acme-host");
        let globex_db = registry.overlay(&TenantId::new("globex"), "db").unwrap();
        assert_eq!(globex_db["host"], "globex-host");
        assert!(registry.overlay(&TenantId::new("acme"), "cache").is_some());

        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("modkit-tenant-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
