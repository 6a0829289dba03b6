use thiserror::Error;

use super::types::WorkflowStatus;

/// Failures raised by a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {table}/{key}")]
    NotFound { table: String, key: String },

    #[error("Conflicting record in {table}: {key}")]
    Conflict { table: String, key: String },

    /// Concurrent writers kept changing the row between read and write
    #[error("Write contention on {table}/{key}")]
    Contended { table: String, key: String },

    #[error("Precondition failed for {table}/{key}")]
    PreconditionFailed { table: String, key: String },

    #[error("Lock acquisition failed: {reason}")]
    Lock { reason: String },
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::Database(format!("migration failed: {err}"))
    }
}

/// Failures raised by the state manager
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Storage(StorageError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Workflow already exists: {0}")]
    DuplicateWorkflow(String),

    #[error("Invalid transition for workflow {workflow_id}: {from} -> {to}")]
    InvalidTransition {
        workflow_id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Agent {agent_name} is already running for workflow {workflow_id}")]
    ConcurrentExecution {
        workflow_id: String,
        agent_name: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<StorageError> for StateError {
    fn from(err: StorageError) -> Self {
        StateError::Storage(err)
    }
}

impl StateError {
    pub(crate) fn workflow_not_found(id: &str) -> Self {
        StateError::NotFound {
            kind: "Workflow",
            id: id.to_string(),
        }
    }

    pub(crate) fn execution_not_found(id: &str) -> Self {
        StateError::NotFound {
            kind: "Execution",
            id: id.to_string(),
        }
    }
}
