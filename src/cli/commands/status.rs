use anyhow::Result;
use serde_json::json;

use super::{print_workflow, Command};
use crate::config::AgentConfig;
use crate::state::{StateManager, WorkflowStatus};

pub struct StatusCommand {
    pub workflow_id: String,
    pub json: bool,
    config: AgentConfig,
}

impl StatusCommand {
    pub fn new(workflow_id: String, config: AgentConfig) -> Self {
        Self {
            workflow_id,
            json: false,
            config,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for StatusCommand {
    async fn execute(&self) -> Result<()> {
        let state = StateManager::open(&self.config.state).await?;
        let workflow = state.get_workflow(&self.workflow_id).await?;
        let executions = state.list_executions(&self.workflow_id).await?;

        if self.json {
            let report = json!({"workflow": workflow, "executions": executions});
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("📊 WORKFLOW STATUS");
            println!("==================");
            println!();
            print_workflow(&workflow, &executions);
        }

        if workflow.status == WorkflowStatus::Failed {
            std::process::exit(1);
        }
        Ok(())
    }
}
