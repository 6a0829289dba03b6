//! Storage backends for workflow state.
//!
//! Every backend stores the same two tables as opaque JSON documents and
//! enforces the same uniqueness rules, so the state manager never has to know
//! which one it talks to.

pub mod file;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::error::StorageError;
use super::types::{Filter, Record, Table};
use crate::config::{StateBackendKind, StateConfig};

pub use file::FileBackend;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// Conditional writes report `Contended` after this many lost races on the same row
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 16;

/// Durable storage for the `workflows` and `agent_executions` tables.
///
/// Each call completes or fails before returning. Nothing is retried on
/// error; callers decide.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name for logs and status output
    fn name(&self) -> &'static str;

    /// Create tables and indexes. Safe to call repeatedly.
    async fn migrate(&self) -> Result<(), StorageError>;

    /// Insert or replace
    async fn put(&self, table: Table, key: &str, record: Record) -> Result<(), StorageError>;

    /// Atomic create. `Conflict` if the key exists or the record would
    /// violate a uniqueness rule of the table.
    async fn insert(&self, table: Table, key: &str, record: Record) -> Result<(), StorageError>;

    async fn get(&self, table: Table, key: &str) -> Result<Record, StorageError>;

    /// Records matching `filter`, in insertion order
    async fn list(&self, table: Table, filter: &Filter) -> Result<Vec<Record>, StorageError>;

    /// Merge top-level fields of `partial` into the stored record
    async fn update(&self, table: Table, key: &str, partial: Record) -> Result<Record, StorageError> {
        self.update_if(table, key, &Filter::new(), partial).await
    }

    /// Merge only if the stored record matches `expected`, otherwise
    /// `PreconditionFailed`. Returns the merged record.
    async fn update_if(
        &self,
        table: Table,
        key: &str,
        expected: &Filter,
        partial: Record,
    ) -> Result<Record, StorageError>;
}

/// Open the backend selected in configuration, migrating if enabled
pub async fn open_backend(config: &StateConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let backend: Arc<dyn StorageBackend> = match config.backend {
        StateBackendKind::Sqlite => {
            Arc::new(SqliteBackend::connect(&config.sqlite_path, config.max_connections).await?)
        }
        StateBackendKind::Postgres => {
            let url = config.postgres_url.as_deref().ok_or_else(|| {
                StorageError::Database("state.postgres_url is required for the postgres backend".into())
            })?;
            Arc::new(PostgresBackend::connect(url, config.max_connections).await?)
        }
        StateBackendKind::File => Arc::new(FileBackend::new(&config.file_path)),
    };

    if config.auto_migrate {
        backend.migrate().await?;
    }

    info!(backend = backend.name(), "State backend ready");
    Ok(backend)
}

/// Unique-key and partial-index violations surface as `Conflict`
pub(crate) fn classify_write_error(err: sqlx::Error, table: Table, key: &str) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict {
            table: table.to_string(),
            key: key.to_string(),
        },
        _ => err.into(),
    }
}

pub(crate) fn not_found(table: Table, key: &str) -> StorageError {
    StorageError::NotFound {
        table: table.to_string(),
        key: key.to_string(),
    }
}

pub(crate) fn precondition_failed(table: Table, key: &str) -> StorageError {
    StorageError::PreconditionFailed {
        table: table.to_string(),
        key: key.to_string(),
    }
}

pub(crate) fn lost_race(table: Table, key: &str) -> StorageError {
    StorageError::Contended {
        table: table.to_string(),
        key: key.to_string(),
    }
}

pub(crate) fn decode_body(body: &str) -> Result<Record, StorageError> {
    Ok(serde_json::from_str(body)?)
}

pub(crate) fn encode_body(record: &Record) -> Result<String, StorageError> {
    Ok(serde_json::to_string(record)?)
}
