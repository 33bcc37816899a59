//! Configuration module for the Topoform engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `topoform.yaml`
//! - Validation of declarations before graph construction
//! - Computing configuration hashes for change tracking

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    EngineSettings, GuardrailsConfig, LifecycleConfig, ProjectConfig, ResourceSpec,
    RetrySettings, SimulatorConfig, StateBackend, StateConfig, TopologyConfig, TypeSchema,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
