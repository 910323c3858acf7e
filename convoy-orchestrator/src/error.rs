//! Error types for the control plane
//!
//! Configuration errors are fatal and surface to the caller that triggered
//! validation. Repository and lock errors are transient: asynchronous paths
//! log and absorb them.

use thiserror::Error;

/// Result type alias for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Errors raised by persistence adapters
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Query failed in the database
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored JSON could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A unique key was already taken by a concurrent writer
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// An optimistic update lost against a concurrent writer
    #[error("concurrent modification of {entity} {id}")]
    ConcurrentModification { entity: &'static str, id: String },

    /// Stored data does not describe a valid entity
    #[error("corrupt {entity} record {id}: {message}")]
    Corrupt {
        entity: &'static str,
        id: String,
        message: String,
    },
}

impl RepositoryError {
    pub fn corrupt(entity: &'static str, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            entity,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Self::DuplicateKey(_) => true,
            Self::Database(sqlx::Error::Database(err)) => err.is_unique_violation(),
            _ => false,
        }
    }

    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

/// Invalid administrator-supplied configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A scope constrains no dimension at all
    #[error("scope '{name}' ({id}) cannot be empty")]
    EmptyScope { id: String, name: String },
}

/// Errors raised by the distributed lock
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(#[from] RepositoryError),
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Backend(RepositoryError::Database(err))
    }
}

/// Errors raised while routing a task to a worker
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Errors raised while fanning a scope edit out to workers
#[derive(Debug, Error)]
pub enum ScopeUpdateError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Another scope edit for the account is in progress
    #[error("scope update for account {0} is already in progress")]
    Contended(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Errors raised while projecting a pipeline execution
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// No compiled graph exists for the pipeline
    #[error("no state machine found for pipeline {pipeline_id} in app {app_id}")]
    MissingStateMachine { app_id: String, pipeline_id: String },

    /// The pipeline being projected does not exist
    #[error("pipeline {pipeline_id} not found in app {app_id}")]
    PipelineNotFound { app_id: String, pipeline_id: String },

    /// The requested pipeline execution does not exist
    #[error("pipeline execution {0} not found")]
    ExecutionNotFound(uuid::Uuid),

    /// An instance exists for a state the projection cannot render
    #[error("state '{state_name}' has unsupported type {state_type}")]
    UnknownStateType {
        state_name: String,
        state_type: String,
    },

    /// Graph and recorded instances have diverged
    #[error("invalid state machine: {0}")]
    InvalidGraph(#[from] convoy_core::domain::pipeline::StateMachineError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
