use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{open_backend, StorageBackend};
use super::error::{StateError, StorageError};
use super::transitions::{check_transition, Transition};
use super::types::{
    from_record, to_record, ExecutionRecord, ExecutionStatus, Filter, Record, Table, Workflow,
    WorkflowStatus,
};
use crate::config::StateConfig;

/// Sole owner of workflow and execution state.
///
/// Every read goes to the backend; nothing is cached, so a status query from
/// another process always sees the latest durable state.
#[derive(Clone)]
pub struct StateManager {
    backend: Arc<dyn StorageBackend>,
}

impl StateManager {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Open the configured backend
    pub async fn open(config: &StateConfig) -> Result<Self, StateError> {
        Ok(Self::new(open_backend(config).await?))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn create_workflow(
        &self,
        workflow_id: &str,
        platform: &str,
        environment: &str,
        config: Value,
    ) -> Result<Workflow, StateError> {
        let now = Utc::now();
        let workflow = Workflow {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Pending,
            platform: platform.to_string(),
            environment: environment.to_string(),
            config,
            outputs: Default::default(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
        };

        match self
            .backend
            .insert(Table::Workflows, workflow_id, to_record(&workflow)?)
            .await
        {
            Ok(()) => {
                info!(workflow_id, platform, environment, "Workflow created");
                Ok(workflow)
            }
            Err(StorageError::Conflict { .. }) => {
                Err(StateError::DuplicateWorkflow(workflow_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create with an id of the form `{platform}-{environment}-{8 hex}`
    pub async fn create_workflow_with_generated_id(
        &self,
        platform: &str,
        environment: &str,
        config: Value,
    ) -> Result<Workflow, StateError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let workflow_id = format!("{}-{}-{}", platform, environment, &suffix[..8]);
        self.create_workflow(&workflow_id, platform, environment, config)
            .await
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, StateError> {
        match self.backend.get(Table::Workflows, workflow_id).await {
            Ok(record) => Ok(from_record(record)?),
            Err(StorageError::NotFound { .. }) => Err(StateError::workflow_not_found(workflow_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// All workflows in creation order
    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, StateError> {
        let records = self.backend.list(Table::Workflows, &Filter::new()).await?;
        records
            .into_iter()
            .map(|record| from_record(record).map_err(StateError::from))
            .collect()
    }

    pub async fn update_workflow_status(
        &self,
        workflow_id: &str,
        new_status: WorkflowStatus,
    ) -> Result<Workflow, StateError> {
        let mut previous = None;
        let workflow = self
            .mutate_workflow(workflow_id, |workflow| {
                match check_transition(workflow.status, new_status) {
                    Transition::Allowed | Transition::NoOp => {
                        previous = Some(workflow.status);
                        workflow.status = new_status;
                        Ok(())
                    }
                    Transition::Rejected => Err(StateError::InvalidTransition {
                        workflow_id: workflow_id.to_string(),
                        from: workflow.status,
                        to: new_status,
                    }),
                }
            })
            .await?;

        match previous {
            Some(from) if from != new_status => {
                info!(workflow_id, from = %from, to = %new_status, "Workflow status changed")
            }
            _ => debug!(workflow_id, status = %new_status, "Workflow status unchanged"),
        }
        Ok(workflow)
    }

    /// Merge `payload` into `outputs[step_name]`. Object payloads merge key by
    /// key; anything else replaces the entry.
    pub async fn append_output(
        &self,
        workflow_id: &str,
        step_name: &str,
        payload: Value,
    ) -> Result<Workflow, StateError> {
        self.mutate_workflow(workflow_id, |workflow| {
            ensure_accepts_appends(workflow)?;
            let slot = workflow
                .outputs
                .entry(step_name.to_string())
                .or_insert(Value::Null);
            match (slot, payload.clone()) {
                (Value::Object(existing), Value::Object(incoming)) => {
                    for (key, value) in incoming {
                        existing.insert(key, value);
                    }
                }
                (slot, incoming) => *slot = incoming,
            }
            Ok(())
        })
        .await
    }

    pub async fn append_error(
        &self,
        workflow_id: &str,
        message: &str,
    ) -> Result<Workflow, StateError> {
        let workflow = self
            .mutate_workflow(workflow_id, |workflow| {
                ensure_accepts_appends(workflow)?;
                workflow.errors.push(message.to_string());
                Ok(())
            })
            .await?;
        warn!(workflow_id, error = message, "Workflow error recorded");
        Ok(workflow)
    }

    pub async fn start_execution(
        &self,
        workflow_id: &str,
        agent_name: &str,
        input_data: Value,
    ) -> Result<ExecutionRecord, StateError> {
        self.get_workflow(workflow_id).await?;

        let record = ExecutionRecord {
            execution_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            agent_name: agent_name.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            input_data,
            output_data: Value::Null,
            error_message: None,
            logs: Vec::new(),
        };

        match self
            .backend
            .insert(Table::AgentExecutions, &record.execution_id, to_record(&record)?)
            .await
        {
            Ok(()) => {
                info!(
                    workflow_id,
                    agent_name,
                    execution_id = %record.execution_id,
                    "Execution started"
                );
                Ok(record)
            }
            Err(StorageError::Conflict { .. }) => Err(StateError::ConcurrentExecution {
                workflow_id: workflow_id.to_string(),
                agent_name: agent_name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn complete_execution(
        &self,
        execution_id: &str,
        output_data: Value,
        logs: Vec<String>,
    ) -> Result<ExecutionRecord, StateError> {
        let record = self
            .finish_execution(execution_id, ExecutionStatus::Succeeded, Some(output_data), None, logs)
            .await?;
        info!(execution_id, agent_name = %record.agent_name, "Execution succeeded");
        Ok(record)
    }

    pub async fn fail_execution(
        &self,
        execution_id: &str,
        error_message: &str,
        logs: Vec<String>,
    ) -> Result<ExecutionRecord, StateError> {
        let record = self
            .finish_execution(
                execution_id,
                ExecutionStatus::Failed,
                None,
                Some(error_message),
                logs,
            )
            .await?;
        warn!(
            execution_id,
            agent_name = %record.agent_name,
            error = error_message,
            "Execution failed"
        );
        Ok(record)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StateError> {
        match self.backend.get(Table::AgentExecutions, execution_id).await {
            Ok(record) => Ok(from_record(record)?),
            Err(StorageError::NotFound { .. }) => {
                Err(StateError::execution_not_found(execution_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Executions of a workflow in creation order
    pub async fn list_executions(&self, workflow_id: &str) -> Result<Vec<ExecutionRecord>, StateError> {
        self.query_executions(Filter::new().where_eq("workflow_id", workflow_id))
            .await
    }

    pub async fn running_executions(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StateError> {
        self.query_executions(
            Filter::new()
                .where_eq("workflow_id", workflow_id)
                .where_eq("status", ExecutionStatus::Running.as_str()),
        )
        .await
    }

    async fn query_executions(&self, filter: Filter) -> Result<Vec<ExecutionRecord>, StateError> {
        let records = self.backend.list(Table::AgentExecutions, &filter).await?;
        records
            .into_iter()
            .map(|record| from_record(record).map_err(StateError::from))
            .collect()
    }

    async fn finish_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output_data: Option<Value>,
        error_message: Option<&str>,
        logs: Vec<String>,
    ) -> Result<ExecutionRecord, StateError> {
        let current = self.get_execution(execution_id).await?;
        if current.status != ExecutionStatus::Running {
            return Err(not_running(&current));
        }

        let mut all_logs = current.logs.clone();
        all_logs.extend(logs);

        let mut partial = Record::new();
        partial.insert("status".into(), json!(status));
        partial.insert("completed_at".into(), json!(Utc::now()));
        partial.insert("logs".into(), json!(all_logs));
        if let Some(output) = output_data {
            partial.insert("output_data".into(), output);
        }
        if let Some(message) = error_message {
            partial.insert("error_message".into(), json!(message));
        }

        let expected = Filter::new().where_eq("status", ExecutionStatus::Running.as_str());
        match self
            .backend
            .update_if(Table::AgentExecutions, execution_id, &expected, partial)
            .await
        {
            Ok(record) => Ok(from_record(record)?),
            Err(StorageError::PreconditionFailed { .. }) => {
                // Finished by someone else between our read and write
                let latest = self.get_execution(execution_id).await?;
                Err(not_running(&latest))
            }
            Err(StorageError::NotFound { .. }) => Err(StateError::execution_not_found(execution_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read, apply, and write back guarded by the observed revision. A lost
    /// race re-reads and re-applies against the fresh record. Every lost race
    /// means another writer committed, so the loop always makes progress.
    async fn mutate_workflow<F>(&self, workflow_id: &str, mut apply: F) -> Result<Workflow, StateError>
    where
        F: FnMut(&mut Workflow) -> Result<(), StateError>,
    {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let current = self.get_workflow(workflow_id).await?;
            let mut next = current.clone();
            apply(&mut next)?;
            next.revision = current.revision + 1;
            next.updated_at = advance(current.updated_at);

            let expected = Filter::new().where_eq("revision", current.revision);
            match self
                .backend
                .update_if(Table::Workflows, workflow_id, &expected, to_record(&next)?)
                .await
            {
                Ok(_) => return Ok(next),
                Err(StorageError::PreconditionFailed { .. } | StorageError::Contended { .. }) => {
                    debug!(workflow_id, attempt, "Workflow revision moved, retrying against fresh state");
                    tokio::task::yield_now().await;
                }
                Err(StorageError::NotFound { .. }) => {
                    return Err(StateError::workflow_not_found(workflow_id))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Strictly after `previous`, even when the clock has not moved
fn advance(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

fn ensure_accepts_appends(workflow: &Workflow) -> Result<(), StateError> {
    if workflow.status.is_terminal() {
        return Err(StateError::InvalidState(format!(
            "workflow {} is {} and no longer accepts updates",
            workflow.workflow_id, workflow.status
        )));
    }
    Ok(())
}

fn not_running(record: &ExecutionRecord) -> StateError {
    StateError::InvalidState(format!(
        "execution {} is {}, not running",
        record.execution_id, record.status
    ))
}
