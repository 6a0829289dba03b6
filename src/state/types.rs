//! Workflow and execution record types shared by the state manager and its
//! storage backends.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::error::StorageError;

/// A stored document. Top-level fields are what `update` merges.
pub type Record = Map<String, Value>;

/// Lifecycle of a deployment workflow, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Planning,
    Provisioning,
    Configuring,
    Validating,
    Documenting,
    Completed,
    Failed,
    RolledBack,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 9] = [
        WorkflowStatus::Pending,
        WorkflowStatus::Planning,
        WorkflowStatus::Provisioning,
        WorkflowStatus::Configuring,
        WorkflowStatus::Validating,
        WorkflowStatus::Documenting,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::RolledBack,
    ];

    /// Position in the forward ordering.
    pub fn rank(&self) -> u8 {
        match self {
            WorkflowStatus::Pending => 0,
            WorkflowStatus::Planning => 1,
            WorkflowStatus::Provisioning => 2,
            WorkflowStatus::Configuring => 3,
            WorkflowStatus::Validating => 4,
            WorkflowStatus::Documenting => 5,
            WorkflowStatus::Completed => 6,
            WorkflowStatus::Failed => 7,
            WorkflowStatus::RolledBack => 8,
        }
    }

    /// No mutation of any kind is accepted once here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Provisioning => "provisioning",
            WorkflowStatus::Configuring => "configuring",
            WorkflowStatus::Validating => "validating",
            WorkflowStatus::Documenting => "documenting",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unknown workflow status: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end deployment request and its accumulated state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub platform: String,
    pub environment: String,
    pub config: Value,
    pub outputs: Map<String, Value>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Internal compare-and-swap token, not part of the workflow's data.
    /// Bumped on every write, including a same-status update, which
    /// otherwise changes only `updated_at`.
    #[serde(default)]
    pub revision: u64,
}

/// Audit entry for a single step attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub agent_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ExecutionRecord {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

/// The two record collections every backend stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Workflows,
    AgentExecutions,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Workflows => "workflows",
            Table::AgentExecutions => "agent_executions",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality filter over top-level record fields. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }
}

/// Shallow merge: top-level keys of `partial` overwrite those in `record`.
pub fn merge(record: &mut Record, partial: Record) {
    for (key, value) in partial {
        record.insert(key, value);
    }
}

/// Columns the SQL backends index on
pub const PROJECTED_FIELDS: [&str; 3] = ["workflow_id", "agent_name", "status"];

pub fn projected_str<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

pub fn to_record<T: Serialize>(value: &T) -> Result<Record, StorageError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::Serialization(format!(
            "expected an object, got {other}"
        ))),
    }
}

pub fn from_record<T: DeserializeOwned>(record: Record) -> Result<T, StorageError> {
    Ok(serde_json::from_value(Value::Object(record))?)
}
