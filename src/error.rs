//! Error types for the thot stack engine.
//!
//! This module provides the error hierarchy for every phase of a deployment:
//! configuration, graph construction, provisioning, execution, output
//! resolution and state management.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the thot stack engine.
#[derive(Debug, Error)]
pub enum ThotError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Graph construction errors (detected before anything is provisioned).
    #[error("Stack graph error: {0}")]
    Graph(#[from] GraphError),

    /// Backend provisioning errors.
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Stack output resolution errors.
    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

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
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Errors raised while building the stack graph.
///
/// All of these are fatal and occur before any backend call is made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Two resources share the same id.
    #[error("Duplicate resource id: {id}")]
    DuplicateResourceId {
        /// The duplicated id.
        id: String,
    },

    /// A reference points at a resource or output that does not exist.
    #[error("Dangling reference in {resource}.{input}: ${{{reference}}} ({reason})")]
    DanglingReference {
        /// Resource (or stack output) holding the reference.
        resource: String,
        /// Input name holding the reference.
        input: String,
        /// The reference as written (`id.output`).
        reference: String,
        /// Why the reference cannot be satisfied.
        reason: String,
    },

    /// The reference edges contain a cycle.
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// The resources on the cycle, first id repeated at the end.
        cycle: Vec<String>,
    },

    /// An input is not part of the kind's schema.
    #[error("Unknown input '{input}' for {kind} resource '{resource}'")]
    UnknownInput {
        /// Resource id.
        resource: String,
        /// Kind name.
        kind: String,
        /// Offending input name.
        input: String,
    },

    /// A required input was not declared.
    #[error("Missing required input '{input}' for {kind} resource '{resource}'")]
    MissingInput {
        /// Resource id.
        resource: String,
        /// Kind name.
        kind: String,
        /// Missing input name.
        input: String,
    },

    /// A literal input has the wrong type.
    #[error("Input '{input}' of resource '{resource}' expects {expected}, found {found}")]
    InputTypeMismatch {
        /// Resource id.
        resource: String,
        /// Input name.
        input: String,
        /// Expected value type.
        expected: String,
        /// Found value type.
        found: String,
    },
}

/// Errors returned by a provisioning backend for a single call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// The call did not complete within its timeout.
    #[error("{operation} timed out after {after_secs}s")]
    Timeout {
        /// Operation that timed out (create, update, delete, read).
        operation: String,
        /// Timeout that elapsed, in seconds.
        after_secs: u64,
    },

    /// The backend refused the request.
    #[error("backend rejected request: {message}")]
    BackendRejected {
        /// Description from the backend.
        message: String,
    },

    /// The backend could not be reached or is failing.
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the failure.
        message: String,
    },
}

/// Errors raised by the provisioning executor or the deployer around it.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A resource was about to be resolved before one of its dependencies was
    /// provisioned. This indicates a scheduler defect.
    #[error("Ordering violation: '{resource}' scheduled before dependency '{dependency}' was provisioned")]
    OrderingViolation {
        /// The resource being resolved.
        resource: String,
        /// The dependency that was not provisioned.
        dependency: String,
    },

    /// One or more resources failed during the run.
    #[error("{} resource(s) failed ({}), {} not started", .failed.len(), .failed.join(", "), .not_started.len())]
    RunFailed {
        /// Resources that failed.
        failed: Vec<String>,
        /// Resources that never started.
        not_started: Vec<String>,
    },

    /// The run was cancelled between batches.
    #[error("Run cancelled before {} resource(s) started", .not_started.len())]
    Cancelled {
        /// Resources that never started.
        not_started: Vec<String>,
    },
}

/// Stack output resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutputError {
    /// The referenced resource has not reached `Provisioned`.
    #[error("Output '{name}' is unresolved: resource '{resource}' is {state}")]
    UnresolvedOutput {
        /// Stack output name.
        name: String,
        /// Resource it depends on.
        resource: String,
        /// Current state of that resource.
        state: String,
    },

    /// No stack output with this name is declared.
    #[error("Unknown stack output: {name}")]
    UnknownOutput {
        /// Requested output name.
        name: String,
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

    /// Local filesystem error.
    #[error("Local state backend error: {message}")]
    Filesystem {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
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
}

/// Result type alias for thot operations.
pub type Result<T> = std::result::Result<T, ThotError>;

impl ThotError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error was raised before any provisioning happened.
    #[must_use]
    pub const fn is_build_time(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_))
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
}

impl ProvisionError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::BackendRejected {
            message: message.into(),
        }
    }

    /// Creates an unavailability error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    /// Returns true if a backend may retry the call on its own.
    ///
    /// The engine itself never retries.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Short name of the error kind, as shown in run reports.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "Timeout",
            Self::BackendRejected { .. } => "BackendRejected",
            Self::BackendUnavailable { .. } => "BackendUnavailable",
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local filesystem error with the given message.
    #[must_use]
    pub fn filesystem(message: impl Into<String>) -> Self {
        Self::Filesystem {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = GraphError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(ProvisionError::unavailable("503").is_retryable());
        assert!(!ProvisionError::rejected("400").is_retryable());
        assert!(
            !ProvisionError::Timeout {
                operation: "create".into(),
                after_secs: 1
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_build_time_classification() {
        let err = ThotError::from(GraphError::DuplicateResourceId { id: "x".into() });
        assert!(err.is_build_time());
        let err = ThotError::from(ProvisionError::rejected("nope"));
        assert!(!err.is_build_time());
    }
}
