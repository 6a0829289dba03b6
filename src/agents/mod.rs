//! Step runners
//!
//! Each step wraps one external collaborator (LLM, Terraform, kubectl, the
//! filesystem) and reports an explicit `StepResult`. Steps never touch the
//! state store; the orchestrator records their lifecycle.

pub mod documentation;
pub mod infrastructure;
pub mod monitoring;
pub mod planner;
pub mod validation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::PathBuf;

pub use documentation::DocumentationStep;
pub use infrastructure::InfrastructureStep;
pub use monitoring::MonitoringStep;
pub use planner::PlannerStep;
pub use validation::ValidationStep;

/// What a step receives: the request context plus everything earlier steps produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub workflow_id: String,
    pub context: Value,
    pub previous_outputs: Map<String, Value>,
}

impl StepInput {
    pub fn new(workflow_id: impl Into<String>, context: Value, previous_outputs: Map<String, Value>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            context,
            previous_outputs,
        }
    }

    /// Stored verbatim as the execution's `input_data`
    pub fn to_value(&self) -> Value {
        json!({
            "workflow_id": self.workflow_id,
            "context": self.context,
            "previous_outputs": self.previous_outputs,
        })
    }

    pub fn previous(&self, step: &str) -> Option<&Value> {
        self.previous_outputs.get(step)
    }

    /// The planner's optimized configuration when present, else the raw context
    pub fn effective_config(&self) -> &Value {
        self.previous("planner")
            .and_then(|planner| planner.get("optimized_config"))
            .unwrap_or(&self.context)
    }

    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.previous("infrastructure")
            .and_then(|infra| infra.get("kubeconfig_path"))
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub data: Value,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub message: String,
    pub logs: Vec<String>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            message: message.into(),
            logs,
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type StepResult = Result<StepOutput, StepFailure>;

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Agent name recorded on execution records and used as the outputs key
    fn name(&self) -> &'static str;

    async fn run(&self, input: &StepInput) -> StepResult;
}

/// String field of a JSON object, or `default`
pub(crate) fn str_or<'a>(value: &'a Value, key: &str, default: &'a str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or(default)
}
