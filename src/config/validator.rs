//! Configuration validation for topology specs.
//!
//! Validation runs before the graph builder so that malformed input never
//! reaches it: names, duplicates, dangling dependencies and references, and
//! engine settings are all checked here.

use crate::error::{ConfigError, Result, TopoformError};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{EngineSettings, ResourceSpec, TopologyConfig};

/// Validator for topology configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a topology configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if validation fails.
    pub fn validate(&self, config: &TopologyConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(
                "Configuration validation passed with {} warnings",
                result.warnings.len()
            );
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(TopoformError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &TopologyConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_resources(config, &mut result);
        Self::validate_types(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(config: &TopologyConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_project_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    /// Validates engine settings.
    fn validate_engine(engine: &EngineSettings, result: &mut ValidationResult) {
        if engine.parallelism == 0 {
            result.errors.push(ValidationError {
                field: String::from("engine.parallelism"),
                message: String::from("Parallelism must be at least 1"),
            });
        }

        let retry = &engine.retry;
        if retry.max_attempts == 0 {
            result.errors.push(ValidationError {
                field: String::from("engine.retry.max_attempts"),
                message: String::from("Retry attempts must be at least 1"),
            });
        }

        if retry.multiplier < 1.0 || !retry.multiplier.is_finite() {
            result.errors.push(ValidationError {
                field: String::from("engine.retry.multiplier"),
                message: format!(
                    "Backoff multiplier must be a finite number >= 1.0, got {}",
                    retry.multiplier
                ),
            });
        }

        if retry.max_backoff_ms < retry.initial_backoff_ms {
            result.warnings.push(format!(
                "engine.retry: max_backoff_ms ({}) is below initial_backoff_ms ({}); every delay will be capped",
                retry.max_backoff_ms, retry.initial_backoff_ms
            ));
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(config: &TopologyConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let declared: HashSet<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
        let mut seen_names = HashSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource name: {}", resource.name),
                });
            }

            if !is_valid_resource_name(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only letters, digits, '_' or '-'.",
                        resource.name
                    ),
                });
            }

            if resource.resource_type.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!("Resource '{}' has no type", resource.name),
                });
            } else if !config.types.is_empty() && !config.types.contains_key(&resource.resource_type) {
                result.warnings.push(format!(
                    "{prefix}.type: No schema declared for type '{}'; all attributes are treated as mutable",
                    resource.resource_type
                ));
            }

            Self::validate_dependencies(resource, &prefix, &declared, result);
        }
    }

    /// Validates explicit and reference dependencies of a resource.
    fn validate_dependencies(
        resource: &ResourceSpec,
        prefix: &str,
        declared: &HashSet<&str>,
        result: &mut ValidationResult,
    ) {
        for (i, target) in resource.depends_on.iter().enumerate() {
            if target == &resource.name {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.depends_on[{i}]"),
                    message: format!("Resource '{}' depends on itself", resource.name),
                });
            } else if !declared.contains(target.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.depends_on[{i}]"),
                    message: format!(
                        "Resource '{}' depends on undeclared resource '{target}'",
                        resource.name
                    ),
                });
            }
        }

        for (key, value) in &resource.attributes {
            for reference in value.references() {
                if !declared.contains(reference.resource.as_str()) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.attributes.{key}"),
                        message: format!(
                            "Reference {reference} points at undeclared resource '{}'",
                            reference.resource
                        ),
                    });
                }
            }
        }
    }

    /// Validates type schemas.
    fn validate_types(config: &TopologyConfig, result: &mut ValidationResult) {
        for (name, schema) in &config.types {
            for attribute in &schema.immutable {
                if schema.computed.contains(attribute) {
                    result.warnings.push(format!(
                        "types.{name}: '{attribute}' is both immutable and computed"
                    ));
                }
            }

            if !config.resources.iter().any(|r| &r.resource_type == name) {
                result
                    .warnings
                    .push(format!("types.{name}: Schema is not used by any resource"));
            }
        }
    }
}

/// Project names are lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource names start with a letter and never contain dots, which delimit references.
fn is_valid_resource_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };

    first.is_ascii_alphabetic() && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
