use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::{module_config_or_default, ConfigError, ConfigProvider};
use crate::observer::ObserverSubject;
use crate::service_registry::ServiceRegistry;

#[derive(Clone)]
pub struct ModuleCtx {
    module_name: Arc<str>,
    config_provider: Arc<dyn ConfigProvider>,
    client_hub: Arc<crate::client_hub::ClientHub>,
    cancellation_token: CancellationToken,
    service_registry: Arc<ServiceRegistry>,
    observers: Arc<ObserverSubject>,
}

/// Builds module-scoped contexts sharing the process-wide collaborators.
pub struct ModuleContextBuilder {
    config_provider: Arc<dyn ConfigProvider>,
    client_hub: Arc<crate::client_hub::ClientHub>,
    root_token: CancellationToken,
    service_registry: Arc<ServiceRegistry>,
    observers: Arc<ObserverSubject>,
}

impl ModuleContextBuilder {
    #[must_use]
    pub fn new(
        config_provider: Arc<dyn ConfigProvider>,
        client_hub: Arc<crate::client_hub::ClientHub>,
        root_token: CancellationToken,
        service_registry: Arc<ServiceRegistry>,
        observers: Arc<ObserverSubject>,
    ) -> Self {
        Self { config_provider, client_hub, root_token, service_registry, observers }
    }

    #[must_use]
    pub fn for_module(&self, module_name: &str) -> ModuleCtx {
        ModuleCtx::new(
            Arc::<str>::from(module_name),
            self.config_provider.clone(),
            self.client_hub.clone(),
            self.root_token.child_token(),
            self.service_registry.clone(),
            self.observers.clone(),
        )
    }
}

impl ModuleCtx {
    #[must_use]
    pub fn new(
        module_name: impl Into<Arc<str>>,
        config_provider: Arc<dyn ConfigProvider>,
        client_hub: Arc<crate::client_hub::ClientHub>,
        cancellation_token: CancellationToken,
        service_registry: Arc<ServiceRegistry>,
        observers: Arc<ObserverSubject>,
    ) -> Self {
        Self { module_name: module_name.into(), config_provider, client_hub, cancellation_token, service_registry, observers }
    }

    /// Build a minimal context for unit tests that don't need a real config
    /// provider, registry, or observer subject.
    #[must_use]
    pub fn for_tests(module_name: &str) -> Self {
        struct EmptyConfigProvider;
        impl ConfigProvider for EmptyConfigProvider {
            fn get_module_config(&self, _module_name: &str) -> Option<&serde_json::Value> {
                None
            }
        }

        let observers = Arc::new(ObserverSubject::new());
        Self::new(
            module_name,
            Arc::new(EmptyConfigProvider),
            Arc::new(crate::client_hub::ClientHub::default()),
            CancellationToken::new(),
            Arc::new(ServiceRegistry::new(crate::service_registry::ConflictPolicy::default(), observers.clone())),
            observers,
        )
    }

    // ---- public read-only API for modules ----

    #[inline]
    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    #[inline]
    #[must_use]
    pub fn config_provider(&self) -> &dyn ConfigProvider {
        &*self.config_provider
    }

    #[inline]
    #[must_use]
    pub fn client_hub(&self) -> &crate::client_hub::ClientHub {
        &self.client_hub
    }

    #[inline]
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// The name- and capability-based service registry. Dependency resolution
    /// is lazy: a module looks up its own dependencies here, inside its own
    /// `init`, where the concrete (or trait-object) type is statically known —
    /// the same way modules already pull collaborators out of `client_hub()`.
    /// There is no eager field-injection step, since nothing upstream of a
    /// module's own code can name its dependency's type.
    #[inline]
    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.service_registry
    }

    #[inline]
    #[must_use]
    pub fn events(&self) -> &ObserverSubject {
        &self.observers
    }

    #[must_use]
    pub fn current_module(&self) -> Option<&str> {
        Some(&self.module_name)
    }

    /// Deserialize the module's config section into T, or use defaults if missing.
    ///
    /// This method uses lenient configuration loading: if the module is not present in config,
    /// has no config section, or the module entry is not an object, it returns `T::default()`.
    ///
    /// It extracts the 'config' field from: `modules.<name> = { config: ... }`
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the module's config section fails to deserialize into `T`.
    pub fn config<T: DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        module_config_or_default(self.config_provider.as_ref(), &self.module_name)
    }

    /// Get the raw JSON value of the module's config section.
    /// Returns the 'config' field from: modules.<name> = { config: ... }
    #[must_use]
    pub fn raw_config(&self) -> &serde_json::Value {
        use std::sync::LazyLock;

        static EMPTY: LazyLock<serde_json::Value> = LazyLock::new(|| serde_json::Value::Object(serde_json::Map::new()));

        if let Some(module_raw) = self.config_provider.get_module_config(&self.module_name) {
            if let Some(obj) = module_raw.as_object() {
                if let Some(config_section) = obj.get("config") {
                    return config_section;
                }
            }
        }
        &EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Debug, PartialEq, Deserialize, Default)]
    struct TestConfig {
        #[serde(default)]
        api_key: String,
        #[serde(default)]
        timeout_ms: u64,
        #[serde(default)]
        enabled: bool,
    }

    struct MockConfigProvider {
        modules: HashMap<String, serde_json::Value>,
    }

    impl MockConfigProvider {
        fn new() -> Self {
            let mut modules = HashMap::new();
            modules.insert(
                "test_module".to_string(),
                json!({
                    "config": {
                        "api_key": "secret123",
                        "timeout_ms": 5000,
                        "enabled": true
                    }
                }),
            );
            Self { modules }
        }
    }

    impl ConfigProvider for MockConfigProvider {
        fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
            self.modules.get(module_name)
        }
    }

    fn test_builder(provider: Arc<dyn ConfigProvider>) -> ModuleContextBuilder {
        let observers = Arc::new(ObserverSubject::new());
        ModuleContextBuilder::new(
            provider,
            Arc::new(crate::client_hub::ClientHub::default()),
            CancellationToken::new(),
            Arc::new(ServiceRegistry::new(crate::service_registry::ConflictPolicy::default(), observers.clone())),
            observers,
        )
    }

    #[test]
    fn config_with_valid_config_deserializes() {
        let provider: Arc<dyn ConfigProvider> = Arc::new(MockConfigProvider::new());
        let ctx = test_builder(provider).for_module("test_module");

        let config: TestConfig = ctx.config().unwrap();
        assert_eq!(config.api_key, "secret123");
        assert_eq!(config.timeout_ms, 5000);
        assert!(config.enabled);
    }

    #[test]
    fn config_returns_default_for_missing_module() {
        let provider: Arc<dyn ConfigProvider> = Arc::new(MockConfigProvider::new());
        let ctx = test_builder(provider).for_module("nonexistent_module");

        let config: TestConfig = ctx.config().unwrap();
        assert_eq!(config, TestConfig::default());
    }

    #[tokio::test]
    async fn services_registry_is_shared_across_derived_contexts() {
        let provider: Arc<dyn ConfigProvider> = Arc::new(MockConfigProvider::new());
        let builder = test_builder(provider);
        let ctx_a = builder.for_module("a");
        ctx_a
            .services()
            .register("greeting", "a", Arc::new(String::from("hi")), crate::service_registry::RegisterOptions::default())
            .await
            .unwrap();

        let ctx_b = builder.for_module("b");
        let resolved = ctx_b.services().resolve::<String>("greeting").unwrap();
        assert_eq!(*resolved, "hi");
    }
}
