use async_trait::async_trait;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    classify_write_error, decode_body, encode_body, lost_race, not_found, precondition_failed,
    StorageBackend, MAX_WRITE_ATTEMPTS,
};
use crate::state::error::StorageError;
use crate::state::types::{merge, projected_str, Filter, Record, Table, PROJECTED_FIELDS};

/// SQLite-backed state store
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if needed) the database file at `path`
    pub async fn connect(path: &Path, max_connections: u32) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let database_url = format!("sqlite://{}", path.display());
        if !Sqlite::database_exists(&database_url).await? {
            info!("Creating database at {}", database_url);
            Sqlite::create_database(&database_url).await?;
        }

        // Separate CLI processes share the file, so wait on SQLITE_BUSY instead of failing fast
        let options = SqliteConnectOptions::new()
            .filename(path)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn write_row(
        &self,
        sql: &str,
        table: Table,
        key: &str,
        record: &Record,
    ) -> Result<(), StorageError> {
        let body = encode_body(record)?;
        sqlx::query(sql)
            .bind(key)
            .bind(projected_str(record, "workflow_id"))
            .bind(projected_str(record, "agent_name"))
            .bind(projected_str(record, "status"))
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_write_error(e, table, key))?;
        Ok(())
    }

    async fn fetch_body(&self, table: Table, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT body FROM {} WHERE record_key = ?1",
            table.as_str()
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get::<String, _>("body")?),
            None => None,
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn put(&self, table: Table, key: &str, record: Record) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            INSERT INTO {} (record_key, workflow_id, agent_name, status, body)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(record_key) DO UPDATE SET
                workflow_id = excluded.workflow_id,
                agent_name = excluded.agent_name,
                status = excluded.status,
                body = excluded.body
            "#,
            table.as_str()
        );
        self.write_row(&sql, table, key, &record).await
    }

    async fn insert(&self, table: Table, key: &str, record: Record) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            INSERT INTO {} (record_key, workflow_id, agent_name, status, body)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            table.as_str()
        );
        self.write_row(&sql, table, key, &record).await
    }

    async fn get(&self, table: Table, key: &str) -> Result<Record, StorageError> {
        let body = self
            .fetch_body(table, key)
            .await?
            .ok_or_else(|| not_found(table, key))?;
        decode_body(&body)
    }

    async fn list(&self, table: Table, filter: &Filter) -> Result<Vec<Record>, StorageError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT body FROM {} WHERE 1 = 1", table.as_str()));

        // Narrow on indexed columns; the full filter is re-applied below
        for (field, value) in filter.conditions() {
            if let (true, Some(value)) = (PROJECTED_FIELDS.contains(&field.as_str()), value.as_str()) {
                query
                    .push(" AND ")
                    .push(field.as_str())
                    .push(" = ")
                    .push_bind(value.to_string());
            }
        }
        query.push(" ORDER BY seq");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = decode_body(&row.try_get::<String, _>("body")?)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn update_if(
        &self,
        table: Table,
        key: &str,
        expected: &Filter,
        partial: Record,
    ) -> Result<Record, StorageError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET workflow_id = ?1, agent_name = ?2, status = ?3, body = ?4
            WHERE record_key = ?5 AND body = ?6
            "#,
            table.as_str()
        );

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let old_body = self
                .fetch_body(table, key)
                .await?
                .ok_or_else(|| not_found(table, key))?;
            let mut record = decode_body(&old_body)?;
            if !expected.matches(&record) {
                return Err(precondition_failed(table, key));
            }
            merge(&mut record, partial.clone());
            let new_body = encode_body(&record)?;

            let result = sqlx::query(&sql)
                .bind(projected_str(&record, "workflow_id"))
                .bind(projected_str(&record, "agent_name"))
                .bind(projected_str(&record, "status"))
                .bind(&new_body)
                .bind(key)
                .bind(&old_body)
                .execute(&self.pool)
                .await
                .map_err(|e| classify_write_error(e, table, key))?;

            if result.rows_affected() == 1 {
                return Ok(record);
            }
            debug!(table = %table, key, attempt, "Row changed underneath update, re-reading");
        }

        Err(lost_race(table, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::to_record;
    use serde_json::json;
    use tempfile::TempDir;

    async fn backend() -> (TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::connect(&dir.path().join("state.db"), 4)
            .await
            .unwrap();
        backend.migrate().await.unwrap();
        (dir, backend)
    }

    fn execution(id: &str, agent: &str, status: &str) -> Record {
        to_record(&json!({
            "execution_id": id,
            "workflow_id": "wf-1",
            "agent_name": agent,
            "status": status,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let (_dir, backend) = backend().await;
        backend.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_key() {
        let (_dir, backend) = backend().await;
        let record = to_record(&json!({"workflow_id": "wf-1", "status": "pending"})).unwrap();
        backend.insert(Table::Workflows, "wf-1", record.clone()).await.unwrap();

        let err = backend.insert(Table::Workflows, "wf-1", record).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_single_running_execution_per_agent() {
        let (_dir, backend) = backend().await;
        backend
            .insert(Table::AgentExecutions, "e1", execution("e1", "planner", "running"))
            .await
            .unwrap();

        let err = backend
            .insert(Table::AgentExecutions, "e2", execution("e2", "planner", "running"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        // A different agent is unaffected
        backend
            .insert(Table::AgentExecutions, "e3", execution("e3", "infrastructure", "running"))
            .await
            .unwrap();

        let mut done = Record::new();
        done.insert("status".into(), json!("succeeded"));
        backend.update(Table::AgentExecutions, "e1", done).await.unwrap();

        backend
            .insert(Table::AgentExecutions, "e2", execution("e2", "planner", "running"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order_and_filters() {
        let (_dir, backend) = backend().await;
        for (id, agent) in [("z", "planner"), ("a", "monitoring"), ("m", "validation")] {
            backend
                .insert(Table::AgentExecutions, id, execution(id, agent, "succeeded"))
                .await
                .unwrap();
        }

        let all = backend
            .list(Table::AgentExecutions, &Filter::new().where_eq("workflow_id", "wf-1"))
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|r| r["execution_id"].clone()).collect();
        assert_eq!(ids, vec![json!("z"), json!("a"), json!("m")]);

        let monitoring = backend
            .list(Table::AgentExecutions, &Filter::new().where_eq("agent_name", "monitoring"))
            .await
            .unwrap();
        assert_eq!(monitoring.len(), 1);
    }

    #[tokio::test]
    async fn test_update_if_checks_expected_fields() {
        let (_dir, backend) = backend().await;
        let record = to_record(&json!({"workflow_id": "wf-1", "revision": 3, "config": {"a": 1}})).unwrap();
        backend.put(Table::Workflows, "wf-1", record).await.unwrap();

        let mut partial = Record::new();
        partial.insert("revision".into(), json!(4));
        let err = backend
            .update_if(Table::Workflows, "wf-1", &Filter::new().where_eq("revision", 2), partial.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed { .. }));

        let merged = backend
            .update_if(Table::Workflows, "wf-1", &Filter::new().where_eq("revision", 3), partial)
            .await
            .unwrap();
        assert_eq!(merged["revision"], json!(4));
        assert_eq!(merged["config"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_missing_keys_are_not_found() {
        let (_dir, backend) = backend().await;
        assert!(matches!(
            backend.get(Table::Workflows, "nope").await.unwrap_err(),
            StorageError::NotFound { .. }
        ));
        assert!(matches!(
            backend.update(Table::Workflows, "nope", Record::new()).await.unwrap_err(),
            StorageError::NotFound { .. }
        ));
    }
}
