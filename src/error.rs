//! Error types for the Topoform engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, value resolution, graph construction, planning,
//! provider calls, state management, and apply.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Topoform engine.
#[derive(Debug, Error)]
pub enum TopoformError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Value resolution errors.
    #[error("Value error: {0}")]
    Value(#[from] ValueError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Api(#[from] ApiError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },
}

/// Value resolution errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// A reference pointed at a resource or attribute that was never materialized.
    #[error("Unresolved reference {reference}: {reason}")]
    UnresolvedReference {
        /// The reference token, e.g. `${vpc.id}`.
        reference: String,
        /// Why it could not be resolved.
        reason: String,
    },

    /// A value could not be converted.
    #[error("Invalid value: {message}")]
    Invalid {
        /// Description of the problem.
        message: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The reference graph contains a cycle.
    #[error("Cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Resource chain forming the cycle; first and last entries are equal.
        cycle: Vec<String>,
    },

    /// A resource references or depends on an undeclared resource.
    #[error("Resource '{from}' depends on unknown resource '{target}'")]
    UnknownResource {
        /// The resource holding the dependency.
        from: String,
        /// The missing target.
        target: String,
    },

    /// Two resources share a name.
    #[error("Duplicate resource '{name}' in graph")]
    DuplicateResource {
        /// The duplicated name.
        name: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A protected resource would be destroyed.
    #[error("Resource '{resource}' has prevent_destroy set but the plan would {action} it")]
    PreventDestroy {
        /// The protected resource.
        resource: String,
        /// The offending action (destroy or replace).
        action: String,
    },

    /// A destroy target is not present in state.
    #[error("Destroy target '{name}' is not present in state")]
    UnknownTarget {
        /// The missing target name.
        name: String,
    },

    /// Dependency resolution failed.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Categories of transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Connection-level failure.
    Network,
    /// Request timed out.
    Timeout,
    /// Provider asked us to slow down.
    Throttled,
}

/// Provider API errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// A failure that is expected to succeed on retry.
    #[error("Transient {kind} failure: {message}")]
    Transient {
        /// Failure category.
        kind: TransientKind,
        /// Description of the failure.
        message: String,
        /// Provider hint for how long to wait, in milliseconds.
        retry_after_ms: Option<u64>,
    },

    /// A failure that will not succeed on retry.
    #[error("Permanent failure: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// The remote object does not exist.
    #[error("{resource_type} '{id}' not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Provider identifier.
        id: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State changed on disk since it was loaded.
    #[error("State changed since it was loaded (expected serial {expected}, found {found}); reload and re-plan")]
    Conflict {
        /// Serial this session last observed.
        expected: u64,
        /// Serial currently on disk.
        found: u64,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// Resource not present in state.
    #[error("Resource '{name}' not found in state")]
    ResourceNotFound {
        /// Name of the missing resource.
        name: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The apply was aborted before any mutation.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({attempts}) exceeded for {resource}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Resource that failed.
        resource: String,
    },
}

/// Result type alias for Topoform operations.
pub type Result<T> = std::result::Result<T, TopoformError>;

impl TopoformError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Api(api) => api.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if this error means state must be reloaded.
    #[must_use]
    pub const fn is_state_conflict(&self) -> bool {
        matches!(self, Self::State(StateError::Conflict { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ValueError {
    /// Creates an unresolved-reference error.
    #[must_use]
    pub fn unresolved(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

impl ApiError {
    /// Creates a transient network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transient {
            kind: TransientKind::Network,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Creates a transient throttling error with an optional wait hint.
    #[must_use]
    pub fn throttled(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::Transient {
            kind: TransientKind::Throttled,
            message: message.into(),
            retry_after_ms,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Returns true if retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the provider's wait hint, if any.
    #[must_use]
    pub const fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Transient { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Throttled => "throttling",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_lists_chain() {
        let err = GraphError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_retryability() {
        assert!(TopoformError::from(ApiError::network("reset")).is_retryable());
        assert!(TopoformError::from(ApiError::throttled("slow down", Some(10))).is_retryable());
        assert!(!TopoformError::from(ApiError::permanent("bad request")).is_retryable());
        assert!(TopoformError::from(StateError::Conflict { expected: 1, found: 2 }).is_state_conflict());
    }
}
