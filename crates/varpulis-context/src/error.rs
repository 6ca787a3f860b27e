//! Error types for nested context orchestration.

use crate::controller::{ControllerId, PathId, PartitionId};
use crate::statement::StatementId;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors raised by the context partition orchestrator.
///
/// Operations on handles whose partition is already gone are not errors:
/// sibling partitioning schemes terminate in no guaranteed order, so a stale
/// handle is silently ignored.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Statement '{statement}' is incompatible with context '{context}': {reason}")]
    Validation {
        context: String,
        statement: String,
        reason: String,
    },

    #[error("Context '{context}' declares sub-context '{name}' more than once")]
    DuplicateContextName { context: String, name: String },

    #[error("Context '{0}' declares no nesting levels")]
    EmptyDeclaration(String),

    #[error("Invalid context partition selector '{found}', expected one of {{{expected}}}")]
    InvalidSelector { found: String, expected: String },

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Statement {0} is already attached")]
    DuplicateStatement(StatementId),

    #[error("Statement {0} is not attached")]
    UnknownStatement(StatementId),

    #[error("Controller {0} is not part of the context tree")]
    UnknownController(ControllerId),

    #[error("Controller {controller} already has a child at path {path_id}")]
    PathInUse {
        controller: ControllerId,
        path_id: PathId,
    },

    #[error("Partition id {0} is already in use")]
    PartitionIdInUse(PartitionId),

    #[error("Context '{context}' reached its limit of {limit} partitions")]
    PartitionLimit { context: String, limit: usize },

    #[error("Failed to start statement '{statement}' in partition {partition_id}: {reason}")]
    AgentStart {
        statement: String,
        partition_id: PartitionId,
        reason: String,
    },

    #[error("Failed to stop statement '{statement}' in partition {partition_id}: {reason}")]
    AgentStop {
        statement: String,
        partition_id: PartitionId,
        reason: String,
    },

    #[error("Invalid context declaration: {0}")]
    InvalidDeclaration(String),

    #[error("Failed to initialise logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ContextError {
    /// Build an `InvalidSelector` error naming the accepted selector kinds.
    pub fn invalid_selector(found: &str, expected: &[&str]) -> Self {
        ContextError::InvalidSelector {
            found: found.to_string(),
            expected: expected.join(", "),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
