use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    classify_write_error, decode_body, encode_body, lost_race, not_found, precondition_failed,
    StorageBackend, MAX_WRITE_ATTEMPTS,
};
use crate::state::error::StorageError;
use crate::state::types::{merge, projected_str, Filter, Record, Table, PROJECTED_FIELDS};

/// PostgreSQL-backed state store, for shared deployments
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
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
            "SELECT body FROM {} WHERE record_key = $1",
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
impl StorageBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn put(&self, table: Table, key: &str, record: Record) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            INSERT INTO {} (record_key, workflow_id, agent_name, status, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (record_key) DO UPDATE SET
                workflow_id = EXCLUDED.workflow_id,
                agent_name = EXCLUDED.agent_name,
                status = EXCLUDED.status,
                body = EXCLUDED.body
            "#,
            table.as_str()
        );
        self.write_row(&sql, table, key, &record).await
    }

    async fn insert(&self, table: Table, key: &str, record: Record) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            INSERT INTO {} (record_key, workflow_id, agent_name, status, body)
            VALUES ($1, $2, $3, $4, $5)
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
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT body FROM {} WHERE TRUE", table.as_str()));

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
            SET workflow_id = $1, agent_name = $2, status = $3, body = $4
            WHERE record_key = $5 AND body = $6
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

    /// Runs only when a scratch database is provided
    async fn backend() -> Option<PostgresBackend> {
        let url = std::env::var("TK8S_TEST_POSTGRES_URL").ok()?;
        let backend = PostgresBackend::connect(&url, 2).await.unwrap();
        backend.migrate().await.unwrap();
        Some(backend)
    }

    #[tokio::test]
    async fn test_running_uniqueness_enforced_by_partial_index() {
        let Some(backend) = backend().await else {
            return;
        };
        let workflow_id = format!("wf-{}", uuid::Uuid::new_v4().simple());
        let record = |id: &str| {
            to_record(&json!({
                "execution_id": id,
                "workflow_id": workflow_id,
                "agent_name": "planner",
                "status": "running",
            }))
            .unwrap()
        };

        let first = uuid::Uuid::new_v4().to_string();
        let second = uuid::Uuid::new_v4().to_string();
        backend.insert(Table::AgentExecutions, &first, record(&first)).await.unwrap();
        let err = backend
            .insert(Table::AgentExecutions, &second, record(&second))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        let listed = backend
            .list(Table::AgentExecutions, &Filter::new().where_eq("workflow_id", workflow_id.as_str()))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }
}
