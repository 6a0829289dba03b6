use anyhow::Result;

use super::{status_icon, Command};
use crate::config::AgentConfig;
use crate::state::StateManager;

pub struct ListCommand {
    config: AgentConfig,
}

impl ListCommand {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

impl Command for ListCommand {
    async fn execute(&self) -> Result<()> {
        let state = StateManager::open(&self.config.state).await?;
        let workflows = state.list_workflows().await?;

        if workflows.is_empty() {
            println!("📭 No workflows yet. Start one with: terraform-k8s-agent create");
            return Ok(());
        }

        println!("📋 WORKFLOWS ({}):", workflows.len());
        println!("────────────────");
        for workflow in &workflows {
            println!(
                "{} {:<40} {:<12} {:<6} {:<12} {}",
                status_icon(workflow.status),
                workflow.workflow_id,
                workflow.status.as_str(),
                workflow.platform,
                workflow.environment,
                workflow.created_at.format("%Y-%m-%d %H:%M")
            );
        }
        Ok(())
    }
}
