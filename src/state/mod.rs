//! Workflow state management: the status state machine, execution audit
//! records, and the storage backends that persist them.

pub mod backend;
pub mod error;
pub mod manager;
pub mod transitions;
pub mod types;

pub use backend::{open_backend, FileBackend, PostgresBackend, SqliteBackend, StorageBackend};
pub use error::{StateError, StorageError};
pub use manager::StateManager;
pub use transitions::{check_transition, Transition};
pub use types::{ExecutionRecord, ExecutionStatus, Filter, Record, Table, Workflow, WorkflowStatus};
