//! Name- and capability-based service registry.
//!
//! Modules publish instances under a logical name during `configure`/`init`;
//! other modules resolve them either by that name or by a structural
//! [`CapabilityDescriptor`]. Rust has no reflection-driven interface
//! conformance, so capability matching is declarative: a provider states the
//! capability tags it satisfies at registration time (see the design note in
//! `spec.md` §9) rather than being probed for a method set at resolve time.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::observer::{Event, ObserverSubject, EVENT_SERVICE_REGISTERED};

/// Identity of a structural capability. `fqname` is what shows up in
/// `interface:<fqname>` cycle-diagnostic edges, so it must be globally unique
/// and stable — treat it like a reverse-DNS identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityDescriptor {
    pub fqname: &'static str,
}

impl CapabilityDescriptor {
    #[must_use]
    pub const fn new(fqname: &'static str) -> Self {
        Self { fqname }
    }
}

/// Governs what happens when `Register` is called with a name already present
/// in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Fail the registration outright.
    Error,
    /// Replace the existing entry.
    Overwrite,
    /// Store under a derived unique name (`n.<module>`, `n.<counter>`, ...).
    #[default]
    Rename,
    /// Higher `priority` wins; equal priority keeps the existing entry.
    Priority,
    /// Drop the new registration; the first write wins.
    Ignore,
}

#[derive(Debug, Error)]
pub enum ServiceRegistryError {
    #[error("service '{0}' is already registered")]
    ServiceAlreadyRegistered(String),
    #[error("service '{0}' not found")]
    ServiceNotFound(String),
    #[error("required service '{0}' not found")]
    RequiredServiceNotFound(String),
    #[error("ambiguous capability resolution for '{fqname}': candidates {candidates:?}")]
    AmbiguousCapabilityResolution {
        fqname: String,
        candidates: Vec<String>,
    },
}

/// Options controlling a single `register` call.
#[derive(Default, Clone)]
pub struct RegisterOptions {
    pub capabilities: Vec<CapabilityDescriptor>,
    pub priority: i32,
}

impl RegisterOptions {
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<CapabilityDescriptor>) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

struct StoredEntry {
    original_name: String,
    actual_name: String,
    module: String,
    capabilities: Vec<CapabilityDescriptor>,
    priority: i32,
    registered_at: u64,
    instance: Box<dyn Any + Send + Sync>,
}

/// A read-only snapshot of a service's registry metadata, safe to hand out to
/// callers without exposing the stored instance.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub original_name: String,
    pub actual_name: String,
    pub module: String,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub priority: i32,
    pub registered_at: u64,
}

impl From<&StoredEntry> for ServiceEntry {
    fn from(e: &StoredEntry) -> Self {
        Self {
            original_name: e.original_name.clone(),
            actual_name: e.actual_name.clone(),
            module: e.module.clone(),
            capabilities: e.capabilities.clone(),
            priority: e.priority,
            registered_at: e.registered_at,
        }
    }
}

/// Name- and capability-based service registry.
///
/// Reads are the common case (resolution happens on every module's `init` and
/// on every later lookup); writes (registrations) are rare, so entries are
/// guarded by a reader-friendly lock, matching `ClientHub`'s approach.
pub struct ServiceRegistry {
    policy: ConflictPolicy,
    entries: RwLock<HashMap<String, StoredEntry>>,
    sequence: AtomicU64,
    observers: Arc<ObserverSubject>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(policy: ConflictPolicy, observers: Arc<ObserverSubject>) -> Self {
        Self {
            policy,
            entries: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            observers,
        }
    }

    /// Register `instance` under `name`, returning the actual name it was
    /// stored under (which may differ from `name` under the `Rename` policy).
    /// Emits `service.registered` with the actual name and owning module.
    ///
    /// # Errors
    /// Returns [`ServiceRegistryError::ServiceAlreadyRegistered`] under the
    /// `Error` policy when `name` already exists.
    pub async fn register<T: Send + Sync + 'static + ?Sized>(
        &self,
        name: &str,
        module: &str,
        instance: Arc<T>,
        opts: RegisterOptions,
    ) -> Result<String, ServiceRegistryError> {
        let actual_name = self.insert(name, module, instance, opts)?;
        if let Err(err) = self
            .observers
            .emit(Event::new(
                "service-registry",
                EVENT_SERVICE_REGISTERED,
                serde_json::json!({ "name": actual_name, "module": module }),
            ))
            .await
        {
            tracing::warn!(error = %err, "service.registered event rejected");
        }
        Ok(actual_name)
    }

    fn insert<T: Send + Sync + 'static + ?Sized>(
        &self,
        name: &str,
        module: &str,
        instance: Arc<T>,
        opts: RegisterOptions,
    ) -> Result<String, ServiceRegistryError> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(name) {
            return match self.policy {
                ConflictPolicy::Error => {
                    Err(ServiceRegistryError::ServiceAlreadyRegistered(name.to_owned()))
                }
                ConflictPolicy::Ignore => Ok(existing.actual_name.clone()),
                ConflictPolicy::Overwrite => {
                    entries.insert(
                        name.to_owned(),
                        Self::build_entry(name, name, module, instance, opts, seq),
                    );
                    Ok(name.to_owned())
                }
                ConflictPolicy::Priority => {
                    if opts.priority > existing.priority {
                        entries.insert(
                            name.to_owned(),
                            Self::build_entry(name, name, module, instance, opts, seq),
                        );
                        Ok(name.to_owned())
                    } else {
                        Ok(existing.actual_name.clone())
                    }
                }
                ConflictPolicy::Rename => {
                    let actual = Self::derive_unique_name(&entries, name, module);
                    entries.insert(
                        actual.clone(),
                        Self::build_entry(name, &actual, module, instance, opts, seq),
                    );
                    Ok(actual)
                }
            };
        }

        entries.insert(
            name.to_owned(),
            Self::build_entry(name, name, module, instance, opts, seq),
        );
        Ok(name.to_owned())
    }

    fn build_entry<T: Send + Sync + 'static + ?Sized>(
        original_name: &str,
        actual_name: &str,
        module: &str,
        instance: Arc<T>,
        opts: RegisterOptions,
        registered_at: u64,
    ) -> StoredEntry {
        StoredEntry {
            original_name: original_name.to_owned(),
            actual_name: actual_name.to_owned(),
            module: module.to_owned(),
            capabilities: opts.capabilities,
            priority: opts.priority,
            registered_at,
            instance: Box::new(instance),
        }
    }

    /// `n.<module>`, then `n.<counter>` — the type-qualified middle rung from
    /// spec.md §4.2 collapses into the counter rung here since Rust has no
    /// ambient "module type name" distinct from the owning module's name.
    fn derive_unique_name(
        entries: &HashMap<String, StoredEntry>,
        name: &str,
        module: &str,
    ) -> String {
        let module_qualified = format!("{name}.{module}");
        if !entries.contains_key(&module_qualified) {
            return module_qualified;
        }
        let mut counter = 2u64;
        loop {
            let candidate = format!("{name}.{counter}");
            if !entries.contains_key(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Resolve a service by its actual name.
    ///
    /// # Errors
    /// Returns [`ServiceRegistryError::ServiceNotFound`] if absent or of the
    /// wrong type.
    pub fn resolve<T: Send + Sync + 'static + ?Sized>(&self, name: &str) -> Result<Arc<T>, ServiceRegistryError> {
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .ok_or_else(|| ServiceRegistryError::ServiceNotFound(name.to_owned()))?;
        entry
            .instance
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or_else(|| ServiceRegistryError::ServiceNotFound(name.to_owned()))
    }

    /// Resolve a required service, naming the error after the logical name.
    ///
    /// # Errors
    /// Returns [`ServiceRegistryError::RequiredServiceNotFound`] if absent.
    pub fn resolve_required<T: Send + Sync + 'static + ?Sized>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, ServiceRegistryError> {
        self.resolve(name)
            .map_err(|_| ServiceRegistryError::RequiredServiceNotFound(name.to_owned()))
    }

    fn candidates(&self, descriptor: CapabilityDescriptor) -> Vec<ServiceEntry> {
        let entries = self.entries.read();
        entries
            .values()
            .filter(|e| e.capabilities.contains(&descriptor))
            .map(ServiceEntry::from)
            .collect()
    }

    /// Return the single best match for `descriptor`, applying the tie-break
    /// order from spec.md §4.2: shortest actual name, then highest priority,
    /// then earliest registration.
    ///
    /// # Errors
    /// Returns [`ServiceRegistryError::ServiceNotFound`] if nothing matches, or
    /// [`ServiceRegistryError::AmbiguousCapabilityResolution`] if the top two
    /// candidates remain tied on every criterion.
    pub fn resolve_by_capability<T: Send + Sync + 'static + ?Sized>(
        &self,
        descriptor: CapabilityDescriptor,
    ) -> Result<Arc<T>, ServiceRegistryError> {
        let best = Self::tie_break(self.candidates(descriptor), descriptor)?;
        self.resolve(&best.actual_name)
    }

    /// Return every service satisfying `descriptor`, ordered by the same
    /// tie-break criteria used by `resolve_by_capability`.
    pub fn resolve_all_by_capability<T: Send + Sync + 'static + ?Sized>(
        &self,
        descriptor: CapabilityDescriptor,
    ) -> Vec<Arc<T>> {
        let mut candidates = self.candidates(descriptor);
        Self::sort_candidates(&mut candidates);
        candidates
            .into_iter()
            .filter_map(|c| self.resolve(&c.actual_name).ok())
            .collect()
    }

    fn sort_candidates(candidates: &mut [ServiceEntry]) {
        candidates.sort_by(|a, b| {
            a.actual_name
                .len()
                .cmp(&b.actual_name.len())
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.registered_at.cmp(&b.registered_at))
        });
    }

    fn tie_break(
        mut candidates: Vec<ServiceEntry>,
        descriptor: CapabilityDescriptor,
    ) -> Result<ServiceEntry, ServiceRegistryError> {
        if candidates.is_empty() {
            return Err(ServiceRegistryError::ServiceNotFound(
                descriptor.fqname.to_owned(),
            ));
        }
        Self::sort_candidates(&mut candidates);
        if candidates.len() > 1 {
            let (first, second) = (&candidates[0], &candidates[1]);
            let tied = first.actual_name.len() == second.actual_name.len()
                && first.priority == second.priority
                && first.registered_at == second.registered_at;
            if tied {
                return Err(ServiceRegistryError::AmbiguousCapabilityResolution {
                    fqname: descriptor.fqname.to_owned(),
                    candidates: candidates.into_iter().map(|c| c.actual_name).collect(),
                });
            }
        }
        Ok(candidates.remove(0))
    }

    #[must_use]
    pub fn services_by_module(&self, module: &str) -> Vec<String> {
        self.entries
            .read()
            .values()
            .filter(|e| e.module == module)
            .map(|e| e.actual_name.clone())
            .collect()
    }

    #[must_use]
    pub fn service_entry(&self, name: &str) -> Option<ServiceEntry> {
        self.entries.read().get(name).map(ServiceEntry::from)
    }

    #[must_use]
    pub fn list_all(&self) -> Vec<ServiceEntry> {
        self.entries.read().values().map(ServiceEntry::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> String {
            "hello".to_owned()
        }
    }

    fn registry(policy: ConflictPolicy) -> ServiceRegistry {
        ServiceRegistry::new(policy, Arc::new(ObserverSubject::new()))
    }

    #[tokio::test]
    async fn rename_policy_never_collides() {
        let reg = registry(ConflictPolicy::Rename);
        let first = reg
            .register("cache", "red", Arc::new(Hello), RegisterOptions::default())
            .await
            .unwrap();
        let second = reg
            .register("cache", "blue", Arc::new(Hello), RegisterOptions::default())
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(second, "cache.blue");
        assert_eq!(reg.services_by_module("blue"), vec!["cache.blue"]);
    }

    #[tokio::test]
    async fn priority_policy_keeps_highest() {
        let reg = registry(ConflictPolicy::Priority);
        reg.register::<dyn Greeter>(
            "svc",
            "a",
            Arc::new(Hello),
            RegisterOptions::default().with_priority(1),
        )
        .await
        .unwrap();
        reg.register::<dyn Greeter>(
            "svc",
            "b",
            Arc::new(Hello),
            RegisterOptions::default().with_priority(5),
        )
        .await
        .unwrap();
        assert_eq!(reg.service_entry("svc").unwrap().priority, 5);

        reg.register::<dyn Greeter>(
            "svc",
            "c",
            Arc::new(Hello),
            RegisterOptions::default().with_priority(3),
        )
        .await
        .unwrap();
        assert_eq!(reg.service_entry("svc").unwrap().module, "b");
    }

    #[tokio::test]
    async fn overwrite_policy_keeps_exactly_one_entry() {
        let reg = registry(ConflictPolicy::Overwrite);
        reg.register("svc", "a", Arc::new(Hello), RegisterOptions::default())
            .await
            .unwrap();
        reg.register("svc", "b", Arc::new(Hello), RegisterOptions::default())
            .await
            .unwrap();
        assert_eq!(reg.list_all().len(), 1);
        assert_eq!(reg.service_entry("svc").unwrap().module, "b");
    }

    #[tokio::test]
    async fn ignore_policy_keeps_first_write() {
        let reg = registry(ConflictPolicy::Ignore);
        reg.register("svc", "a", Arc::new(Hello), RegisterOptions::default())
            .await
            .unwrap();
        reg.register("svc", "b", Arc::new(Hello), RegisterOptions::default())
            .await
            .unwrap();
        assert_eq!(reg.service_entry("svc").unwrap().module, "a");
    }

    #[tokio::test]
    async fn error_policy_fails_second_registration() {
        let reg = registry(ConflictPolicy::Error);
        reg.register("svc", "a", Arc::new(Hello), RegisterOptions::default())
            .await
            .unwrap();
        let err = reg
            .register("svc", "b", Arc::new(Hello), RegisterOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceRegistryError::ServiceAlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn capability_tie_break_is_deterministic() {
        let reg = registry(ConflictPolicy::Rename);
        let cap = CapabilityDescriptor::new("com.modular.cache");
        reg.register::<dyn Greeter>(
            "cache.longer.name",
            "a",
            Arc::new(Hello),
            RegisterOptions::default().with_capabilities(vec![cap]),
        )
        .await
        .unwrap();
        reg.register::<dyn Greeter>(
            "c",
            "b",
            Arc::new(Hello),
            RegisterOptions::default().with_capabilities(vec![cap]),
        )
        .await
        .unwrap();

        let resolved = reg.resolve_by_capability::<dyn Greeter>(cap).unwrap();
        assert_eq!(resolved.greet(), "hello");
        let all = reg.resolve_all_by_capability::<dyn Greeter>(cap);
        assert_eq!(all.len(), 2);

        let entry = reg.service_entry("c").unwrap();
        assert_eq!(entry.actual_name, "c");
    }

    #[tokio::test]
    async fn ambiguous_capability_resolution_is_reported() {
        let reg = registry(ConflictPolicy::Error);
        let cap = CapabilityDescriptor::new("com.modular.cache");
        reg.register::<dyn Greeter>(
            "aa",
            "m1",
            Arc::new(Hello),
            RegisterOptions::default().with_capabilities(vec![cap]),
        )
        .await
        .unwrap();
        reg.register::<dyn Greeter>(
            "bb",
            "m2",
            Arc::new(Hello),
            RegisterOptions::default().with_capabilities(vec![cap]),
        )
        .await
        .unwrap();

        let err = reg.resolve_by_capability::<dyn Greeter>(cap).unwrap_err();
        assert!(matches!(
            err,
            ServiceRegistryError::AmbiguousCapabilityResolution { .. }
        ));
    }

    #[test]
    fn required_service_not_found_names_the_service() {
        let reg = registry(ConflictPolicy::Error);
        let err = reg.resolve_required::<dyn Greeter>("missing").unwrap_err();
        assert!(matches!(err, ServiceRegistryError::RequiredServiceNotFound(name) if name == "missing"));
    }
}
