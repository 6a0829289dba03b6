use anyhow::Result;

use super::{status_icon, with_mode, Command};
use crate::config::AgentConfig;
use crate::orchestrator::Orchestrator;

pub struct DestroyCommand {
    pub workflow_id: String,
    config: AgentConfig,
}

impl DestroyCommand {
    pub fn new(workflow_id: String, config: AgentConfig) -> Self {
        Self { workflow_id, config }
    }

    pub fn with_real_mode(mut self, real: bool) -> Self {
        self.config = with_mode(self.config, real);
        self
    }
}

impl Command for DestroyCommand {
    async fn execute(&self) -> Result<()> {
        println!("🧨 Destroying infrastructure for {}", self.workflow_id);

        let orchestrator = Orchestrator::from_config(&self.config).await?;
        let outcome = orchestrator.destroy(&self.workflow_id).await?;

        for line in &outcome.execution.logs {
            println!("   {line}");
        }

        if !outcome.succeeded() {
            println!(
                "❌ Teardown failed: {}",
                outcome.execution.error_message.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }

        println!(
            "{} Infrastructure destroyed; workflow is {}",
            status_icon(outcome.workflow.status),
            outcome.workflow.status.as_str().to_uppercase()
        );
        Ok(())
    }
}
