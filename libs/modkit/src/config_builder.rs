//! Layered, provenance-tracked configuration feeding.
//!
//! Rust has no runtime struct-tag reflection, so the field tags this
//! contract describes (`env`, `default`, `required`, `dynamic`, `sensitive`)
//! are declared as data on [`FieldSpec`] at section-registration time rather
//! than read off a struct via reflection — the same adaptation
//! [`crate::service_registry`] makes for capability descriptors. Sections are
//! fed as [`serde_json::Value`] trees; callers deserialize the result into
//! their own config type once feeding completes.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use modkit_utils::SecretString;

use crate::observer::{Event, ObserverSubject, EVENT_CONFIG_LOADED, EVENT_CONFIG_VALIDATED};

#[derive(Debug, Error)]
pub enum ConfigBuildError {
    #[error("module '{0}' not found in configuration")]
    ModuleNotFound(String),
    #[error("module '{module}' has an invalid structure: {reason}")]
    InvalidModuleStructure { module: String, reason: String },
    #[error("section '{0}' is missing required configuration")]
    MissingConfigSection(String),
    #[error("invalid configuration for section '{section}': {reason}")]
    InvalidConfig { section: String, reason: String },
    #[error("feeder '{feeder}' failed to populate section '{section}': {reason}")]
    ConfigFeederError { feeder: String, section: String, reason: String },
    #[error("required field '{field}' missing in section '{section}'")]
    RequiredFieldMissing { section: String, field: String },
    #[error("validation failed for section '{section}': {reason}")]
    ValidationError { section: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Env,
    Yaml,
    Json,
    Programmatic,
}

/// The declarative equivalent of a field tag: `env:"KEY"`, `default:"..."`,
/// `required:"true"`, `dynamic:"true"`, `sensitive:"true"`.
#[derive(Clone)]
pub struct FieldSpec {
    pub path: &'static str,
    pub env: Option<&'static str>,
    pub default: Option<&'static str>,
    pub required: bool,
    pub dynamic: bool,
    pub sensitive: bool,
    pub desc: &'static str,
}

impl FieldSpec {
    #[must_use]
    pub const fn new(path: &'static str) -> Self {
        Self { path, env: None, default: None, required: false, dynamic: false, sensitive: false, desc: "" }
    }

    #[must_use]
    pub const fn env(mut self, key: &'static str) -> Self {
        self.env = Some(key);
        self
    }

    #[must_use]
    pub const fn default(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub const fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    #[must_use]
    pub const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// A section target: the module that owns it, its fields, and any fields
/// that are maps-of-instances (instance-aware feeding).
pub struct SectionSpec {
    pub module: &'static str,
    pub section: &'static str,
    pub fields: Vec<FieldSpec>,
    pub instance_map_fields: Vec<&'static str>,
    pub validate: Option<fn(&Value) -> Result<(), String>>,
}

impl SectionSpec {
    #[must_use]
    pub fn new(module: &'static str, section: &'static str) -> Self {
        Self { module, section, fields: Vec::new(), instance_map_fields: Vec::new(), validate: None }
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn with_instance_map_field(mut self, field: &'static str) -> Self {
        self.instance_map_fields.push(field);
        self
    }

    #[must_use]
    pub fn with_validate(mut self, validate: fn(&Value) -> Result<(), String>) -> Self {
        self.validate = Some(validate);
        self
    }
}

/// Provenance record for a single populated field.
#[derive(Debug, Clone)]
pub struct FieldPopulation {
    pub feeder: String,
    pub source: SourceKind,
    pub candidates: Vec<String>,
    pub matched_key: Option<String>,
    pub value: Value,
    /// The instance this field belongs to, for map-of-struct (instance-aware)
    /// fields fed via [`EnvFeeder::feed_instances`]. `None` for plain section
    /// fields.
    pub instance_key: Option<String>,
}

#[derive(Default)]
pub struct FieldPopulationTracker {
    records: HashMap<(String, String), FieldPopulation>,
}

impl FieldPopulationTracker {
    fn record(&mut self, section: &str, field: &str, population: FieldPopulation) {
        self.records.insert((section.to_owned(), field.to_owned()), population);
    }

    #[must_use]
    pub fn get(&self, section: &str, field: &str) -> Option<&FieldPopulation> {
        self.records.get(&(section.to_owned(), field.to_owned()))
    }
}

/// One ordered feeder in a [`ConfigBuilder`] pipeline.
pub trait Feeder: Send + Sync {
    fn identity(&self) -> &str;
    fn source_kind(&self) -> SourceKind;

    /// Apply this feeder to `target`, mutating it in place and recording any
    /// populated fields in `tracker`.
    fn feed(&self, section: &SectionSpec, target: &mut Value, tracker: &mut FieldPopulationTracker);
}

/// Feeds from environment variables using the module-aware lookup order
/// `<MODULE>_<KEY>`, `<KEY>_<MODULE>`, `<KEY>`, plus instance-aware feeding
/// for map-of-struct fields via `<section-or-module>_<UPPER(KEY)>_` prefixes.
pub struct EnvFeeder {
    identity: String,
}

impl EnvFeeder {
    #[must_use]
    pub fn new() -> Self {
        Self { identity: "env".to_owned() }
    }

    fn candidates(module: &str, key: &str) -> Vec<String> {
        let module_upper = module.to_uppercase();
        let key_upper = key.to_uppercase();
        vec![format!("{module_upper}_{key_upper}"), format!("{key_upper}_{module_upper}"), key_upper]
    }

    fn set_path(target: &mut Value, path: &str, value: Value) {
        if let Value::Object(map) = target {
            map.insert(path.to_owned(), value);
        }
    }
}

impl Default for EnvFeeder {
    fn default() -> Self {
        Self::new()
    }
}

impl Feeder for EnvFeeder {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Env
    }

    fn feed(&self, section: &SectionSpec, target: &mut Value, tracker: &mut FieldPopulationTracker) {
        for field in &section.fields {
            let Some(env_key) = field.env else { continue };
            let candidates = Self::candidates(section.module, env_key);
            let matched = candidates.iter().find_map(|c| std::env::var(c).ok().map(|v| (c.clone(), v)));
            if let Some((matched_key, raw)) = matched {
                let value = parse_scalar(&raw);
                Self::set_path(target, field.path, value.clone());
                tracker.record(
                    section.section,
                    field.path,
                    FieldPopulation {
                        feeder: self.identity.clone(),
                        source: SourceKind::Env,
                        candidates,
                        matched_key: Some(matched_key),
                        value,
                        instance_key: None,
                    },
                );
            }
        }

        for instance_field in &section.instance_map_fields {
            self.feed_instances(section, instance_field, target, tracker);
        }
    }
}

impl EnvFeeder {
    fn feed_instances(
        &self,
        section: &SectionSpec,
        instance_field: &str,
        target: &mut Value,
        tracker: &mut FieldPopulationTracker,
    ) {
        let Value::Object(map) = target else { return };
        let Some(Value::Object(instances)) = map.get_mut(instance_field) else { return };

        for (instance_key, instance_value) in instances.iter_mut() {
            let prefix = format!("{}_{}_", section.section.to_uppercase(), instance_key.to_uppercase());
            let Ok(prefix_regex) = Regex::new(&format!("^{}", regex::escape(&prefix))) else { continue };

            for (var_name, var_value) in std::env::vars() {
                if !prefix_regex.is_match(&var_name) {
                    continue;
                }
                let field_key = var_name[prefix.len()..].to_lowercase();
                if let Value::Object(instance_obj) = instance_value {
                    let value = parse_scalar(&var_value);
                    instance_obj.insert(field_key.clone(), value.clone());
                    tracker.record(
                        &format!("{}.{instance_key}", section.section),
                        &field_key,
                        FieldPopulation {
                            feeder: self.identity.clone(),
                            source: SourceKind::Env,
                            candidates: vec![var_name.clone()],
                            matched_key: Some(var_name),
                            value,
                            instance_key: Some(instance_key.clone()),
                        },
                    );
                }
            }
        }
    }
}

fn parse_scalar(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

/// Feeds a whole section from a pre-parsed document (YAML/JSON), merging its
/// top-level object into the target.
pub struct DocumentFeeder {
    identity: String,
    source: SourceKind,
    sections: HashMap<&'static str, Value>,
}

impl DocumentFeeder {
    #[must_use]
    pub fn new(identity: impl Into<String>, source: SourceKind, sections: HashMap<&'static str, Value>) -> Self {
        Self { identity: identity.into(), source, sections }
    }
}

impl Feeder for DocumentFeeder {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn source_kind(&self) -> SourceKind {
        self.source
    }

    fn feed(&self, section: &SectionSpec, target: &mut Value, tracker: &mut FieldPopulationTracker) {
        let Some(Value::Object(incoming)) = self.sections.get(section.section) else { return };
        let Value::Object(target_map) = target else { return };
        for (key, value) in incoming {
            target_map.insert(key.clone(), value.clone());
            tracker.record(
                section.section,
                key,
                FieldPopulation {
                    feeder: self.identity.clone(),
                    source: self.source,
                    candidates: vec![key.clone()],
                    matched_key: Some(key.clone()),
                    value: value.clone(),
                    instance_key: None,
                },
            );
        }
    }
}

/// Feeds a whole section programmatically from an already-built `Value`.
pub struct ProgrammaticFeeder {
    identity: String,
    sections: HashMap<&'static str, Value>,
}

impl ProgrammaticFeeder {
    #[must_use]
    pub fn new(identity: impl Into<String>, sections: HashMap<&'static str, Value>) -> Self {
        Self { identity: identity.into(), sections }
    }
}

impl Feeder for ProgrammaticFeeder {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Programmatic
    }

    fn feed(&self, section: &SectionSpec, target: &mut Value, tracker: &mut FieldPopulationTracker) {
        let Some(Value::Object(incoming)) = self.sections.get(section.section) else { return };
        let Value::Object(target_map) = target else { return };
        for (key, value) in incoming {
            target_map.insert(key.clone(), value.clone());
            tracker.record(
                section.section,
                key,
                FieldPopulation {
                    feeder: self.identity.clone(),
                    source: SourceKind::Programmatic,
                    candidates: vec![key.clone()],
                    matched_key: Some(key.clone()),
                    value: value.clone(),
                    instance_key: None,
                },
            );
        }
    }
}

pub struct FeedResult {
    pub sections: HashMap<&'static str, Value>,
    pub tracker: FieldPopulationTracker,
}

/// Drives an ordered set of feeders over a set of section targets.
#[derive(Default)]
pub struct ConfigBuilder {
    feeders: Vec<Box<dyn Feeder>>,
    sections: Vec<SectionSpec>,
    observers: Option<Arc<ObserverSubject>>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_feeder(mut self, feeder: Box<dyn Feeder>) -> Self {
        self.feeders.push(feeder);
        self
    }

    #[must_use]
    pub fn with_section(mut self, section: SectionSpec) -> Self {
        self.sections.push(section);
        self
    }

    /// Emit `config.loaded`/`config.validated` on this subject as `feed`
    /// completes each stage. Without one, `feed` runs silently.
    #[must_use]
    pub fn with_observers(mut self, observers: Arc<ObserverSubject>) -> Self {
        self.observers = Some(observers);
        self
    }

    async fn notify(&self, event: Event) {
        if let Some(observers) = &self.observers {
            if let Err(err) = observers.emit(event).await {
                tracing::warn!(error = %err, "config event rejected");
            }
        }
    }

    /// # Errors
    /// Returns [`ConfigBuildError::RequiredFieldMissing`] if a `required` field has
    /// no value after all feeders and defaults have run, or
    /// [`ConfigBuildError::ValidationError`] if a section's `validate` hook fails.
    pub async fn feed(&self) -> Result<FeedResult, ConfigBuildError> {
        let mut tracker = FieldPopulationTracker::default();
        let mut sections = HashMap::new();

        for section in &self.sections {
            let mut target = Value::Object(serde_json::Map::new());

            for feeder in &self.feeders {
                feeder.feed(section, &mut target, &mut tracker);
            }

            if let Value::Object(map) = &mut target {
                for field in &section.fields {
                    let is_zero = map.get(field.path).is_none_or(Value::is_null);
                    if is_zero {
                        if let Some(default) = field.default {
                            map.insert(field.path.to_owned(), parse_scalar(default));
                        }
                    }
                }

                for field in &section.fields {
                    if field.required && map.get(field.path).is_none_or(Value::is_null) {
                        return Err(ConfigBuildError::RequiredFieldMissing {
                            section: section.section.to_owned(),
                            field: field.path.to_owned(),
                        });
                    }
                }
            }

            sections.insert(section.section, target);
        }

        self.notify(Event::new(
            "config-builder",
            EVENT_CONFIG_LOADED,
            serde_json::json!({ "sections": sections.keys().collect::<Vec<_>>() }),
        ))
        .await;

        for section in &self.sections {
            let Some(validate) = section.validate else { continue };
            let target = &sections[section.section];
            validate(target)
                .map_err(|reason| ConfigBuildError::ValidationError { section: section.section.to_owned(), reason })?;
        }

        self.notify(Event::new(
            "config-builder",
            EVENT_CONFIG_VALIDATED,
            serde_json::json!({ "sections": sections.keys().collect::<Vec<_>>() }),
        ))
        .await;

        Ok(FeedResult { sections, tracker })
    }
}

/// A diff between two configuration trees, with sensitive fields redacted.
#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    pub changed: HashMap<String, (Value, Value)>,
    pub added: HashMap<String, Value>,
    pub removed: HashMap<String, Value>,
}

impl ConfigDiff {
    #[must_use]
    pub fn compute(old: &Value, new: &Value, sensitive_paths: &[&str]) -> Self {
        let mut diff = Self::default();
        let old_map = old.as_object().cloned().unwrap_or_default();
        let new_map = new.as_object().cloned().unwrap_or_default();

        for (key, new_value) in &new_map {
            match old_map.get(key) {
                None => {
                    diff.added.insert(key.clone(), redact_if_sensitive(key, new_value, sensitive_paths));
                }
                Some(old_value) if old_value != new_value => {
                    diff.changed.insert(
                        key.clone(),
                        (
                            redact_if_sensitive(key, old_value, sensitive_paths),
                            redact_if_sensitive(key, new_value, sensitive_paths),
                        ),
                    );
                }
                Some(_) => {}
            }
        }
        for (key, old_value) in &old_map {
            if !new_map.contains_key(key) {
                diff.removed.insert(key.clone(), redact_if_sensitive(key, old_value, sensitive_paths));
            }
        }
        diff
    }

    pub fn filter_prefix(&self, prefix: &str) -> Self {
        Self {
            changed: self.changed.iter().filter(|(k, _)| k.starts_with(prefix)).map(|(k, v)| (k.clone(), v.clone())).collect(),
            added: self.added.iter().filter(|(k, _)| k.starts_with(prefix)).map(|(k, v)| (k.clone(), v.clone())).collect(),
            removed: self.removed.iter().filter(|(k, _)| k.starts_with(prefix)).map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

fn redact_if_sensitive(key: &str, value: &Value, sensitive_paths: &[&str]) -> Value {
    if sensitive_paths.contains(&key) {
        let raw = value.as_str().map_or_else(|| value.to_string(), ToOwned::to_owned);
        return Value::String(SecretString::new(raw).to_string());
    }
    value.clone()
}
