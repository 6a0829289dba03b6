//! Single JSON document store. Debug only.
//!
//! Every operation takes an advisory lock on a `<file>.lock` sidecar, so
//! separate processes serialize their writes, then loads the whole document
//! and, for writes, replaces it with a rename.

use async_trait::async_trait;
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{not_found, precondition_failed, StorageBackend};
use crate::state::error::StorageError;
use crate::state::types::{merge, projected_str, Filter, Record, Table};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    workflows: Map<String, Value>,
    #[serde(default)]
    agent_executions: Map<String, Value>,
}

impl Document {
    fn table(&self, table: Table) -> &Map<String, Value> {
        match table {
            Table::Workflows => &self.workflows,
            Table::AgentExecutions => &self.agent_executions,
        }
    }

    fn table_mut(&mut self, table: Table) -> &mut Map<String, Value> {
        match table {
            Table::Workflows => &mut self.workflows,
            Table::AgentExecutions => &mut self.agent_executions,
        }
    }

    fn record(&self, table: Table, key: &str) -> Result<Record, StorageError> {
        match self.table(table).get(key) {
            Some(Value::Object(record)) => Ok(record.clone()),
            Some(other) => Err(StorageError::Serialization(format!(
                "{table}/{key} is not an object: {other}"
            ))),
            None => Err(not_found(table, key)),
        }
    }

    /// Same rule the SQL backends enforce with a partial unique index
    fn check_unique(&self, table: Table, key: &str, record: &Record) -> Result<(), StorageError> {
        if table != Table::AgentExecutions || projected_str(record, "status") != Some("running") {
            return Ok(());
        }

        let workflow_id = projected_str(record, "workflow_id");
        let agent_name = projected_str(record, "agent_name");
        let clash = self.agent_executions.iter().any(|(other_key, other)| {
            other_key != key
                && other.get("status").and_then(Value::as_str) == Some("running")
                && other.get("workflow_id").and_then(Value::as_str) == workflow_id
                && other.get("agent_name").and_then(Value::as_str) == agent_name
        });

        if clash {
            Err(StorageError::Conflict {
                table: table.to_string(),
                key: key.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Flat-file state store
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the document under the file lock. Write access
    /// persists the document when `op` succeeds.
    async fn with_document<T, F>(&self, access: Access, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Document) -> Result<T, StorageError> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || {
            ensure_parent(&path)?;
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            let mut lock = RwLock::new(lock_file);

            match access {
                Access::Read => {
                    let _guard = lock.read().map_err(|e| StorageError::Lock {
                        reason: e.to_string(),
                    })?;
                    let mut document = load(&path)?;
                    op(&mut document)
                }
                Access::Write => {
                    let _guard = lock.write().map_err(|e| StorageError::Lock {
                        reason: e.to_string(),
                    })?;
                    let mut document = load(&path)?;
                    let result = op(&mut document)?;
                    save(&path, &document)?;
                    Ok(result)
                }
            }
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }
}

fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<Document, StorageError> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(Document::default()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
        Err(e) => Err(e.into()),
    }
}

fn save(path: &Path, document: &Document) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(document)?.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        // Loading and saving normalizes a missing or partial document
        self.with_document(Access::Write, |_| Ok(())).await?;
        info!(path = %self.path.display(), "State file ready");
        Ok(())
    }

    async fn put(&self, table: Table, key: &str, record: Record) -> Result<(), StorageError> {
        let key = key.to_string();
        self.with_document(Access::Write, move |doc| {
            doc.check_unique(table, &key, &record)?;
            doc.table_mut(table).insert(key, Value::Object(record));
            Ok(())
        })
        .await
    }

    async fn insert(&self, table: Table, key: &str, record: Record) -> Result<(), StorageError> {
        let key = key.to_string();
        self.with_document(Access::Write, move |doc| {
            if doc.table(table).contains_key(&key) {
                return Err(StorageError::Conflict {
                    table: table.to_string(),
                    key,
                });
            }
            doc.check_unique(table, &key, &record)?;
            doc.table_mut(table).insert(key, Value::Object(record));
            Ok(())
        })
        .await
    }

    async fn get(&self, table: Table, key: &str) -> Result<Record, StorageError> {
        let key = key.to_string();
        self.with_document(Access::Read, move |doc| doc.record(table, &key))
            .await
    }

    async fn list(&self, table: Table, filter: &Filter) -> Result<Vec<Record>, StorageError> {
        let filter = filter.clone();
        self.with_document(Access::Read, move |doc| {
            Ok(doc
                .table(table)
                .values()
                .filter_map(|value| value.as_object())
                .filter(|record| filter.matches(record))
                .cloned()
                .collect())
        })
        .await
    }

    async fn update_if(
        &self,
        table: Table,
        key: &str,
        expected: &Filter,
        partial: Record,
    ) -> Result<Record, StorageError> {
        let key = key.to_string();
        let expected = expected.clone();
        self.with_document(Access::Write, move |doc| {
            let mut record = doc.record(table, &key)?;
            if !expected.matches(&record) {
                return Err(precondition_failed(table, &key));
            }
            merge(&mut record, partial);
            doc.check_unique(table, &key, &record)?;
            doc.table_mut(table)
                .insert(key, Value::Object(record.clone()));
            Ok(record)
        })
        .await
    }
}
