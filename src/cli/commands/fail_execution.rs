use anyhow::Result;
use tracing::warn;

use super::Command;
use crate::config::AgentConfig;
use crate::state::{StateError, StateManager};

/// Operator escape hatch for executions left RUNNING by a crashed process
pub struct FailExecutionCommand {
    pub execution_id: String,
    pub reason: String,
    config: AgentConfig,
}

impl FailExecutionCommand {
    pub fn new(execution_id: String, reason: String, config: AgentConfig) -> Self {
        Self {
            execution_id,
            reason,
            config,
        }
    }
}

impl Command for FailExecutionCommand {
    async fn execute(&self) -> Result<()> {
        let state = StateManager::open(&self.config.state).await?;
        let execution = state
            .fail_execution(&self.execution_id, &self.reason, vec!["Marked failed by operator".to_string()])
            .await?;

        let message = format!("{}: {} (marked failed by operator)", execution.agent_name, self.reason);
        match state.append_error(&execution.workflow_id, &message).await {
            Ok(_) => {}
            // Terminal workflows keep their error list frozen
            Err(StateError::InvalidState(reason)) => {
                warn!(workflow_id = %execution.workflow_id, %reason, "Error not recorded on workflow")
            }
            Err(e) => return Err(e.into()),
        }

        println!(
            "❌ Execution {} ({}) of {} marked FAILED",
            execution.execution_id, execution.agent_name, execution.workflow_id
        );
        Ok(())
    }
}
