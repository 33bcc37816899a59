//! Configuration types for the engine.
//!
//! This module defines all the structs that map to the `topoform.yaml` file.
//! These types are declarative and fully describe the desired topology.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state::STATE_DIR;
use crate::value::{Attributes, Value};

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine settings shared by graph builder, planner and executor.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Simulated cloud settings.
    #[serde(default)]
    pub simulator: SimulatorConfig,
    /// Optional guardrails configuration.
    #[serde(default)]
    pub guardrails: Option<GuardrailsConfig>,
    /// Per-type schemas.
    #[serde(default)]
    pub types: IndexMap<String, TypeSchema>,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// In-process state, discarded on exit.
    Memory,
}

/// Immutable engine settings threaded through every stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    /// Maximum operations in flight within a wave.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Retry policy for transient provider failures.
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Retry configuration for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    /// Total attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Settings for the built-in simulated cloud.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// File the simulated cloud persists its objects to.
    #[serde(default)]
    pub path: Option<String>,
    /// Artificial latency per call, in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
}

/// Guardrails applied to plans before they may be executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardrailsConfig {
    /// Maximum number of resources a single plan may destroy.
    #[serde(default)]
    pub max_destroys: Option<usize>,
    /// Whether replacements are allowed at all.
    #[serde(default = "default_allow_replace")]
    pub allow_replace: bool,
}

/// Schema describing a resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TypeSchema {
    /// Attributes that cannot change in place.
    #[serde(default)]
    pub immutable: Vec<String>,
    /// Attributes assigned by the provider.
    #[serde(default)]
    pub computed: Vec<String>,
    /// Defaults filled in before diffing.
    #[serde(default)]
    pub defaults: Attributes,
    /// Whether replacements create the new object before destroying the old.
    #[serde(default)]
    pub create_before_destroy: bool,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Unique resource name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Attributes, literal or referencing other resources.
    #[serde(default)]
    pub attributes: Attributes,
    /// Explicit dependencies that do not appear in attributes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle overrides.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Per-resource lifecycle overrides.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Overrides the type's replacement ordering.
    #[serde(default)]
    pub create_before_destroy: Option<bool>,
    /// Refuse any plan that destroys or replaces this resource.
    #[serde(default)]
    pub prevent_destroy: bool,
}

// Default value functions

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_allow_replace() -> bool {
    true
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySettings {
    /// Returns the initial backoff as a duration.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Returns the maximum backoff as a duration.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl StateConfig {
    /// State directory, relative paths taken from `config_dir`.
    #[must_use]
    pub fn dir(&self, config_dir: &Path) -> PathBuf {
        config_dir.join(self.path.as_deref().unwrap_or(STATE_DIR))
    }
}

impl SimulatorConfig {
    /// File backing the simulated cloud, relative paths taken from
    /// `config_dir`. Defaults to `cloud.json` in the state directory.
    #[must_use]
    pub fn cloud_path(&self, config_dir: &Path, state_dir: &Path) -> PathBuf {
        self.path
            .as_deref()
            .map_or_else(|| state_dir.join("cloud.json"), |path| config_dir.join(path))
    }
}

impl TopologyConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Finds a declared resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Returns the schema for a type, or an empty schema if undeclared.
    #[must_use]
    pub fn schema(&self, resource_type: &str) -> TypeSchema {
        self.types.get(resource_type).cloned().unwrap_or_default()
    }
}

impl TypeSchema {
    /// Returns true if changing `attribute` forces replacement.
    #[must_use]
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.iter().any(|a| a == attribute)
    }

    /// Returns true if `attribute` is assigned by the provider.
    #[must_use]
    pub fn is_computed(&self, attribute: &str) -> bool {
        attribute == "id" || self.computed.iter().any(|a| a == attribute)
    }
}

impl ResourceSpec {
    /// Creates a resource with no attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            attributes: Attributes::new(),
            depends_on: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_depends_on(mut self, target: impl Into<String>) -> Self {
        self.depends_on.push(target.into());
        self
    }

    /// Returns the address used in output (`type.name`).
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    /// Returns the desired attributes with type defaults filled in.
    #[must_use]
    pub fn desired_attributes(&self, schema: &TypeSchema) -> Attributes {
        let mut desired = schema.defaults.clone();
        for (key, value) in &self.attributes {
            desired.insert(key.clone(), value.clone());
        }
        desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_resolve_against_config_dir() {
        let base = Path::new("infra/network");
        let mut state = StateConfig::default();
        assert_eq!(state.dir(base), base.join(".topoform"));
        state.path = Some(String::from("state"));
        assert_eq!(state.dir(base), base.join("state"));

        let state_dir = state.dir(base);
        let mut simulator = SimulatorConfig::default();
        assert_eq!(simulator.cloud_path(base, &state_dir), base.join("state/cloud.json"));
        simulator.path = Some(String::from("sim/cloud.json"));
        assert_eq!(simulator.cloud_path(base, &state_dir), base.join("sim/cloud.json"));
        simulator.path = Some(String::from("/var/lib/cloud.json"));
        assert_eq!(
            simulator.cloud_path(base, &state_dir),
            PathBuf::from("/var/lib/cloud.json")
        );
    }

    #[test]
    fn test_defaults_are_overridden_by_attributes() {
        let mut schema = TypeSchema::default();
        schema.defaults.insert("map_public_ip".into(), Value::Bool(false));
        schema.defaults.insert("tenancy".into(), Value::string("default"));

        let spec = ResourceSpec::new("public_a", "subnet").with_attribute("map_public_ip", true);
        let desired = spec.desired_attributes(&schema);

        assert_eq!(desired.get("map_public_ip"), Some(&Value::Bool(true)));
        assert_eq!(desired.get("tenancy"), Some(&Value::string("default")));
    }

    #[test]
    fn test_id_is_always_computed() {
        let schema = TypeSchema::default();
        assert!(schema.is_computed("id"));
        assert!(!schema.is_computed("cidr_block"));
    }

    #[test]
    fn test_engine_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.parallelism, 4);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_backoff(), Duration::from_millis(200));
    }
}
