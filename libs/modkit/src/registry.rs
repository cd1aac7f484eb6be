//! Dependency graph construction, cycle detection, and topological ordering.
//!
//! Three edge kinds feed the graph: explicit module-name dependencies, named
//! service requirements, and capability-service requirements. Cycle
//! diagnostics must tag every edge with its kind so `module:`, `service:`,
//! and `interface:<fqname>` edges are never confused with one another.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use crate::contracts::{HealthCheckProvider, Module, ReloadableModule, StatefulModule};
use crate::service_registry::CapabilityDescriptor;

/// A required-service declaration, as carried on a [`ModuleEntry`].
#[derive(Clone)]
pub struct RequiredServiceSpec {
    pub name: &'static str,
    pub required: bool,
    pub by_capability: Option<CapabilityDescriptor>,
}

/// A provided-service declaration, as carried on a [`ModuleEntry`].
#[derive(Clone)]
pub struct ProvidedServiceSpec {
    pub name: &'static str,
    pub capabilities: Vec<CapabilityDescriptor>,
}

/// The kind of a dependency edge, rendered into cycle diagnostics as
/// `module:`, `service:`, or `interface:<fqname>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Module,
    NamedService,
    CapabilityService(&'static str),
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Module => write!(f, "module:"),
            EdgeKind::NamedService => write!(f, "service:"),
            EdgeKind::CapabilityService(fqname) => write!(f, "interface:{fqname}"),
        }
    }
}

/// One edge of a reconstructed cycle, in `from -(kind)-> to` form.
#[derive(Clone, Debug)]
pub struct CycleEdge {
    pub from: &'static str,
    pub to: &'static str,
    pub kind: EdgeKind,
}

impl std::fmt::Display for CycleEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -({})-> {}", self.from, self.kind, self.to)
    }
}

pub struct ModuleEntry {
    pub name: &'static str,
    pub module_deps: &'static [&'static str],
    pub required_services: Vec<RequiredServiceSpec>,
    pub provided_services: Vec<ProvidedServiceSpec>,
    pub core: Arc<dyn Module>,
    pub stateful: Option<Arc<dyn StatefulModule>>,
    pub reloadable: Option<Arc<dyn ReloadableModule>>,
    pub health: Option<(Arc<dyn HealthCheckProvider>, bool)>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.name)
            .field("module_deps", &self.module_deps)
            .field("required_services", &self.required_services.len())
            .field("provided_services", &self.provided_services.len())
            .field("has_stateful", &self.stateful.is_some())
            .field("has_reloadable", &self.reloadable.is_some())
            .field("has_health", &self.health.is_some())
            .finish()
    }
}

/// The function type submitted by modules via `inventory::submit!` for
/// compile-time auto-discovery.
pub struct Registrator(pub fn(&mut RegistryBuilder));

inventory::collect!(Registrator);

/// The final, topologically sorted module registry.
pub struct ModuleRegistry {
    modules: Vec<ModuleEntry>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static str> = self.modules.iter().map(|m| m.name).collect();
        f.debug_struct("ModuleRegistry").field("modules", &names).finish()
    }
}

impl ModuleRegistry {
    #[must_use]
    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules
    }

    #[must_use]
    pub fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.iter().find(|e| e.name == name).map(|e| e.core.clone())
    }

    /// Discover via `inventory`, let registrators fill a builder, then build
    /// and topo-sort.
    ///
    /// # Errors
    /// See [`RegistryBuilder::build_topo_sorted`].
    pub fn discover_and_build() -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::default();
        for registrator in inventory::iter::<Registrator> {
            registrator.0(&mut builder);
        }
        builder.build_topo_sorted()
    }
}

/// Builder fed by module registrators; keys are module names, uniqueness is
/// enforced at build time.
#[derive(Default)]
pub struct RegistryBuilder {
    core: HashMap<&'static str, Arc<dyn Module>>,
    module_deps: HashMap<&'static str, &'static [&'static str]>,
    required_services: HashMap<&'static str, Vec<RequiredServiceSpec>>,
    provided_services: HashMap<&'static str, Vec<ProvidedServiceSpec>>,
    stateful: HashMap<&'static str, Arc<dyn StatefulModule>>,
    reloadable: HashMap<&'static str, Arc<dyn ReloadableModule>>,
    health: HashMap<&'static str, (Arc<dyn HealthCheckProvider>, bool)>,
    registration_order: Vec<&'static str>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    /// Register a module's core identity: its name, its module-name
    /// dependencies, and its `init`/`as_any` hook.
    pub fn register_module(
        &mut self,
        name: &'static str,
        module_deps: &'static [&'static str],
        core: Arc<dyn Module>,
    ) {
        if self.core.contains_key(name) {
            self.errors.push(format!("module '{name}' is already registered"));
            return;
        }
        self.core.insert(name, core);
        self.module_deps.insert(name, module_deps);
        self.registration_order.push(name);
    }

    pub fn declare_required_service(&mut self, module: &'static str, spec: RequiredServiceSpec) {
        self.required_services.entry(module).or_default().push(spec);
    }

    pub fn declare_provided_service(&mut self, module: &'static str, spec: ProvidedServiceSpec) {
        self.provided_services.entry(module).or_default().push(spec);
    }

    pub fn register_stateful(&mut self, module: &'static str, stateful: Arc<dyn StatefulModule>) {
        self.stateful.insert(module, stateful);
    }

    pub fn register_reloadable(&mut self, module: &'static str, reloadable: Arc<dyn ReloadableModule>) {
        self.reloadable.insert(module, reloadable);
    }

    pub fn register_health_provider(
        &mut self,
        module: &'static str,
        provider: Arc<dyn HealthCheckProvider>,
        optional: bool,
    ) {
        self.health.insert(module, (provider, optional));
    }

    fn detect_cycle_with_path(
        names: &[&'static str],
        adj: &[Vec<(usize, EdgeKind)>],
    ) -> Option<Vec<CycleEdge>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        #[allow(clippy::too_many_arguments)]
        fn dfs(
            node: usize,
            names: &[&'static str],
            adj: &[Vec<(usize, EdgeKind)>],
            colors: &mut [Color],
            path: &mut Vec<usize>,
            path_edges: &mut Vec<EdgeKind>,
        ) -> Option<Vec<CycleEdge>> {
            colors[node] = Color::Gray;
            path.push(node);

            for (neighbor, kind) in &adj[node] {
                let neighbor = *neighbor;
                match colors[neighbor] {
                    Color::Gray => {
                        if let Some(cycle_start) = path.iter().position(|&n| n == neighbor) {
                            let mut edges = Vec::new();
                            for w in cycle_start..path.len() - 1 {
                                edges.push(CycleEdge {
                                    from: names[path[w]],
                                    to: names[path[w + 1]],
                                    kind: path_edges[w].clone(),
                                });
                            }
                            edges.push(CycleEdge {
                                from: names[*path.last().unwrap_or(&node)],
                                to: names[neighbor],
                                kind: kind.clone(),
                            });
                            return Some(edges);
                        }
                    }
                    Color::White => {
                        path_edges.push(kind.clone());
                        if let Some(cycle) = dfs(neighbor, names, adj, colors, path, path_edges) {
                            return Some(cycle);
                        }
                        path_edges.pop();
                    }
                    Color::Black => {}
                }
            }

            path.pop();
            colors[node] = Color::Black;
            None
        }

        let mut colors = vec![Color::White; names.len()];
        let mut path = Vec::new();
        let mut path_edges = Vec::new();

        for i in 0..names.len() {
            if colors[i] == Color::White {
                if let Some(cycle) = dfs(i, names, adj, &mut colors, &mut path, &mut path_edges) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Finalize, validate, and topologically sort.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidRegistryConfiguration`] for duplicate
    /// registrations, [`RegistryError::ModuleDependencyMissing`] for an
    /// unregistered module-name dependency, [`RegistryError::RequiredServiceNotFound`]
    /// when a required service (by name or capability) has no provider, and
    /// [`RegistryError::CircularDependency`] when the resulting graph has a
    /// cycle.
    pub fn build_topo_sorted(self) -> Result<ModuleRegistry, RegistryError> {
        if !self.errors.is_empty() {
            return Err(RegistryError::InvalidRegistryConfiguration { errors: self.errors });
        }

        let names: Vec<&'static str> = self.registration_order.clone();
        let mut idx: HashMap<&'static str, usize> = HashMap::new();
        for (i, &n) in names.iter().enumerate() {
            idx.insert(n, i);
        }

        let mut adj: Vec<Vec<(usize, EdgeKind)>> = vec![Vec::new(); names.len()];

        // Module-name dependency edges: dependency must initialize before dependent.
        for &name in &names {
            let u = idx[name];
            let deps = self.module_deps.get(name).copied().unwrap_or(&[]);
            for &dep in deps {
                let v = *idx.get(dep).ok_or_else(|| RegistryError::ModuleDependencyMissing {
                    module: name.to_owned(),
                    depends_on: dep.to_owned(),
                })?;
                adj[v].push((u, EdgeKind::Module));
            }
        }

        // Named- and capability-service edges.
        for &name in &names {
            let u = idx[name];
            let Some(required) = self.required_services.get(name) else { continue };
            for req in required {
                match req.by_capability {
                    None => {
                        let provider = names.iter().find(|&&provider_name| {
                            self.provided_services
                                .get(provider_name)
                                .is_some_and(|provided| provided.iter().any(|p| p.name == req.name))
                        });
                        match provider {
                            Some(&provider_name) => {
                                adj[idx[provider_name]].push((u, EdgeKind::NamedService));
                            }
                            None if req.required => {
                                return Err(RegistryError::RequiredServiceNotFound {
                                    module: name.to_owned(),
                                    service: req.name.to_owned(),
                                })
                            }
                            None => {}
                        }
                    }
                    Some(descriptor) => {
                        let mut found_any = false;
                        for &provider_name in &names {
                            let satisfies = self.provided_services.get(provider_name).is_some_and(|provided| {
                                provided.iter().any(|p| p.capabilities.contains(&descriptor))
                            });
                            if satisfies {
                                found_any = true;
                                if provider_name != name {
                                    adj[idx[provider_name]]
                                        .push((u, EdgeKind::CapabilityService(descriptor.fqname)));
                                }
                            }
                        }
                        if !found_any && req.required {
                            return Err(RegistryError::RequiredServiceNotFound {
                                module: name.to_owned(),
                                service: descriptor.fqname.to_owned(),
                            });
                        }
                    }
                }
            }
        }

        if let Some(edges) = Self::detect_cycle_with_path(&names, &adj) {
            return Err(RegistryError::CircularDependency { edges });
        }

        // Kahn's algorithm; ties broken by registration order via a FIFO queue
        // seeded in registration order.
        let mut indeg = vec![0usize; names.len()];
        for adj_list in &adj {
            for (target, _) in adj_list {
                indeg[*target] += 1;
            }
        }

        let mut queue: VecDeque<usize> = VecDeque::new();
        for (i, _) in names.iter().enumerate() {
            if indeg[i] == 0 {
                queue.push_back(i);
            }
        }

        let mut order = Vec::with_capacity(names.len());
        while let Some(u) = queue.pop_front() {
            order.push(u);
            for (w, _) in &adj[u] {
                indeg[*w] -= 1;
                if indeg[*w] == 0 {
                    queue.push_back(*w);
                }
            }
        }

        let mut entries = Vec::with_capacity(order.len());
        for i in order {
            let name = names[i];
            entries.push(ModuleEntry {
                name,
                module_deps: self.module_deps.get(name).copied().unwrap_or(&[]),
                required_services: self.required_services.get(name).cloned().unwrap_or_default(),
                provided_services: self.provided_services.get(name).cloned().unwrap_or_default(),
                core: self.core[name].clone(),
                stateful: self.stateful.get(name).cloned(),
                reloadable: self.reloadable.get(name).cloned(),
                health: self.health.get(name).cloned(),
            });
        }

        tracing::info!(
            modules = ?entries.iter().map(|e| e.name).collect::<Vec<_>>(),
            "module dependency order resolved"
        );

        Ok(ModuleRegistry { modules: entries })
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{module}' depends on unregistered module '{depends_on}'")]
    ModuleDependencyMissing { module: String, depends_on: String },
    #[error("required service '{service}' not found for module '{module}'")]
    RequiredServiceNotFound { module: String, service: String },
    #[error("cyclic dependency detected: {}", .edges.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    CircularDependency { edges: Vec<CycleEdge> },
    #[error("invalid registry configuration:\n{errors:#?}")]
    InvalidRegistryConfiguration { errors: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModuleCtx;

    #[derive(Default)]
    struct DummyCore;
    #[async_trait::async_trait]
    impl Module for DummyCore {
        async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn topo_sort_happy_path() {
        let mut b = RegistryBuilder::default();
        b.register_module("a", &[], Arc::new(DummyCore));
        b.register_module("b", &["a"], Arc::new(DummyCore));

        let reg = b.build_topo_sorted().unwrap();
        let order: Vec<_> = reg.modules().iter().map(|m| m.name).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn module_dependency_missing_is_reported() {
        let mut b = RegistryBuilder::default();
        b.register_module("a", &["missing"], Arc::new(DummyCore));

        let err = b.build_topo_sorted().unwrap_err();
        match err {
            RegistryError::ModuleDependencyMissing { module, depends_on } => {
                assert_eq!(module, "a");
                assert_eq!(depends_on, "missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cycle_is_detected_and_tagged() {
        let mut b = RegistryBuilder::default();
        b.register_module("a", &["b"], Arc::new(DummyCore));
        b.register_module("b", &["a"], Arc::new(DummyCore));

        let err = b.build_topo_sorted().unwrap_err();
        match err {
            RegistryError::CircularDependency { edges } => {
                assert!(edges.iter().all(|e| e.kind == EdgeKind::Module));
                let rendered = edges.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                assert!(rendered.contains("module:"));
            }
            other => panic!("expected CircularDependency, got: {other:?}"),
        }
    }

    #[test]
    fn capability_cycle_is_tagged_with_fqname() {
        let cap_x = CapabilityDescriptor::new("com.modular.x");
        let cap_y = CapabilityDescriptor::new("com.modular.y");

        let mut b = RegistryBuilder::default();
        b.register_module("a", &[], Arc::new(DummyCore));
        b.register_module("b", &[], Arc::new(DummyCore));
        b.declare_provided_service("a", ProvidedServiceSpec { name: "y", capabilities: vec![cap_y] });
        b.declare_provided_service("b", ProvidedServiceSpec { name: "x", capabilities: vec![cap_x] });
        b.declare_required_service(
            "b",
            RequiredServiceSpec { name: "x", required: true, by_capability: Some(cap_y) },
        );
        b.declare_required_service(
            "a",
            RequiredServiceSpec { name: "y", required: true, by_capability: Some(cap_x) },
        );

        let err = b.build_topo_sorted().unwrap_err();
        match err {
            RegistryError::CircularDependency { edges } => {
                let rendered = edges.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                assert!(rendered.contains("interface:com.modular.x"));
                assert!(rendered.contains("interface:com.modular.y"));
            }
            other => panic!("expected CircularDependency, got: {other:?}"),
        }
    }

    #[test]
    fn self_capability_requirement_is_pruned_not_a_cycle() {
        let cap = CapabilityDescriptor::new("com.modular.self");
        let mut b = RegistryBuilder::default();
        b.register_module("a", &[], Arc::new(DummyCore));
        b.declare_provided_service("a", ProvidedServiceSpec { name: "self", capabilities: vec![cap] });
        b.declare_required_service(
            "a",
            RequiredServiceSpec { name: "self", required: true, by_capability: Some(cap) },
        );

        let reg = b.build_topo_sorted().unwrap();
        assert_eq!(reg.modules().len(), 1);
    }

    #[test]
    fn required_service_not_found_when_no_provider_exists() {
        let cap = CapabilityDescriptor::new("com.modular.missing");
        let mut b = RegistryBuilder::default();
        b.register_module("a", &[], Arc::new(DummyCore));
        b.declare_required_service(
            "a",
            RequiredServiceSpec { name: "missing", required: true, by_capability: Some(cap) },
        );

        let err = b.build_topo_sorted().unwrap_err();
        assert!(matches!(err, RegistryError::RequiredServiceNotFound { .. }));
    }

    #[test]
    fn duplicate_registration_reported_as_invalid_configuration() {
        let mut b = RegistryBuilder::default();
        b.register_module("a", &[], Arc::new(DummyCore));
        b.register_module("a", &[], Arc::new(DummyCore));

        let err = b.build_topo_sorted().unwrap_err();
        match err {
            RegistryError::InvalidRegistryConfiguration { errors } => {
                assert!(errors.iter().any(|e| e.contains("already registered")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
