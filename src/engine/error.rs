// SPDX-License-Identifier: MIT

//! Typed error handling for chartflow-rs
//!
//! `ChartflowError` is what the application layer and the CLI see.
//! `WorkflowError` carries the failures of the workflow-state engine and is
//! what the orchestrator receives from a node invocation.

use thiserror::Error;

use crate::engine::node::NodeError;
use crate::engine::state::FieldViolation;

/// Top-level error type for chartflow-rs
#[derive(Debug, Error)]
pub enum ChartflowError {
    /// Configuration errors (bad YAML values, invalid env overrides)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Workflow engine errors
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error wrapper for compatibility
    #[error("{0}")]
    Other(String),
}

/// Errors raised while validating, migrating, snapshotting or executing
/// workflow state.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The payload cannot be parsed into any state shape at all
    #[error(transparent)]
    Malformed(#[from] MalformedStateError),

    /// A state failed validation outside of a node invocation
    #[error("Invalid state: {}", join_violations(.violations))]
    InvalidState { violations: Vec<FieldViolation> },

    /// The state handed to a node failed validation; the node did not run
    #[error("Invalid input state for node '{node}': {}", join_violations(.violations))]
    InvalidInputState {
        node: String,
        violations: Vec<FieldViolation>,
    },

    /// The state produced by a node failed validation
    #[error("Invalid output state from node '{node}': {}", join_violations(.violations))]
    InvalidOutputState {
        node: String,
        violations: Vec<FieldViolation>,
    },

    /// No upgrade path between two schema versions
    #[error(transparent)]
    UnsupportedMigration(#[from] UnsupportedMigrationError),

    /// A node body failed and will not be retried any further
    #[error("Node '{node}' failed on attempt {attempts}: {source}")]
    NodeFailed {
        node: String,
        attempts: u32,
        #[source]
        source: NodeError,
    },

    /// A stored checkpoint no longer matches its recorded checksum
    #[error("Checksum mismatch for session '{session_id}'")]
    ChecksumMismatch { session_id: String },

    /// A checkpoint's header disagrees with the state it carries
    #[error("Checkpoint for session '{session_id}' is inconsistent: {reason}")]
    InconsistentCheckpoint { session_id: String, reason: String },

    /// Checkpoint persistence errors
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A state payload that cannot be interpreted as any schema version.
#[derive(Debug, Error)]
pub enum MalformedStateError {
    #[error("State payload must be a JSON object, found {0}")]
    NotAnObject(&'static str),

    #[error("State payload has no schema_version")]
    MissingVersion,

    #[error("schema_version must be a non-negative 32-bit integer, found {0}")]
    InvalidVersion(String),

    #[error("State payload could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// No transform chain connects the source version to the target version.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnsupportedMigrationError {
    #[error("Cannot migrate state from schema version {from} down to {to}")]
    Downgrade { from: u32, to: u32 },

    #[error("No migration registered from schema version {missing} (requested {from} -> {to})")]
    MissingStep { from: u32, to: u32, missing: u32 },
}

/// A migration step that cannot be added to a registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrationRegistrationError {
    #[error("Migration steps must advance exactly one schema version, got {from} -> {to}")]
    NotSingleStep { from: u32, to: u32 },

    #[error("A migration from schema version {0} is already registered")]
    Duplicate(u32),
}

/// A retry policy value that cannot be run
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("backoff_seconds must be a non-negative number, got {0}")]
    InvalidBackoff(f64),
}

/// Checkpoint store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session id '{0}' cannot be used as a checkpoint key")]
    InvalidSessionId(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ChartflowError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create from a generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<MalformedStateError> for ChartflowError {
    fn from(err: MalformedStateError) -> Self {
        Self::Workflow(err.into())
    }
}

impl From<&str> for ChartflowError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

impl From<String> for ChartflowError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl WorkflowError {
    /// Field-level violations carried by validation failures, if any
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            Self::InvalidState { violations }
            | Self::InvalidInputState { violations, .. }
            | Self::InvalidOutputState { violations, .. } => violations,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::node::ErrorKind;

    #[test]
    fn test_invalid_input_lists_violations() {
        let err = WorkflowError::InvalidInputState {
            node: "render_chart".to_string(),
            violations: vec![
                FieldViolation::missing("session_id"),
                FieldViolation::invalid("data_context.row_limit", "must be at least 1"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Invalid input state for node 'render_chart': session_id: missing; \
             data_context.row_limit: must be at least 1"
        );
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_node_failed_keeps_source() {
        let err = WorkflowError::NodeFailed {
            node: "generate_sql".to_string(),
            attempts: 3,
            source: NodeError::new(ErrorKind::Timeout, "warehouse did not answer"),
        };
        assert!(err.to_string().contains("attempt 3"));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "timeout: warehouse did not answer");
    }

    #[test]
    fn test_migration_error_messages() {
        let err = UnsupportedMigrationError::MissingStep {
            from: 1,
            to: 4,
            missing: 3,
        };
        assert_eq!(
            err.to_string(),
            "No migration registered from schema version 3 (requested 1 -> 4)"
        );
    }

    #[test]
    fn test_chartflow_error_from_str() {
        let err: ChartflowError = "boom".into();
        assert_eq!(err.to_string(), "boom");
        let wrapped: ChartflowError = MalformedStateError::MissingVersion.into();
        assert!(matches!(
            wrapped,
            ChartflowError::Workflow(WorkflowError::Malformed(_))
        ));
    }
}
