use anyhow::Result;

use crate::config::{AgentConfig, DeploymentMode};
use crate::state::{ExecutionRecord, ExecutionStatus, Workflow, WorkflowStatus};

pub mod config;
pub mod create;
pub mod destroy;
pub mod fail_execution;
pub mod list;
pub mod status;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// `--real` upgrades the configured mode; it never downgrades it
pub fn with_mode(mut config: AgentConfig, real: bool) -> AgentConfig {
    if real {
        config.app.deployment_mode = DeploymentMode::Real;
    }
    config
}

pub fn status_icon(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Pending => "⏳",
        WorkflowStatus::Planning => "🧠",
        WorkflowStatus::Provisioning => "🏗️",
        WorkflowStatus::Configuring => "⚙️",
        WorkflowStatus::Validating => "🔍",
        WorkflowStatus::Documenting => "📝",
        WorkflowStatus::Completed => "✅",
        WorkflowStatus::Failed => "❌",
        WorkflowStatus::RolledBack => "↩️",
    }
}

pub fn execution_icon(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "🔄",
        ExecutionStatus::Succeeded => "✅",
        ExecutionStatus::Failed => "❌",
    }
}

/// Workflow header, errors and the execution table
pub fn print_workflow(workflow: &Workflow, executions: &[ExecutionRecord]) {
    println!(
        "{} {} - {}",
        status_icon(workflow.status),
        workflow.workflow_id,
        workflow.status.as_str().to_uppercase()
    );
    println!("   🎯 Platform: {} ({})", workflow.platform, workflow.environment);
    println!("   🕐 Created: {}", workflow.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("   🕐 Updated: {}", workflow.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    for (step, output) in &workflow.outputs {
        if let Some(summary) = output.get("summary").and_then(|s| s.as_str()) {
            println!("   📦 {step}: {summary}");
        }
    }

    if !executions.is_empty() {
        println!();
        println!("📋 EXECUTIONS:");
        println!("──────────────");
        for execution in executions {
            let duration = execution
                .duration()
                .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
                .unwrap_or_else(|| "running".to_string());
            println!(
                "{} {:<14} {:<10} {}  ({})",
                execution_icon(execution.status),
                execution.agent_name,
                execution.status.as_str(),
                execution.execution_id,
                duration
            );
            if let Some(message) = &execution.error_message {
                println!("      ↳ {message}");
            }
        }
    }

    if !workflow.errors.is_empty() {
        println!();
        println!("⚠️  ERRORS ({}):", workflow.errors.len());
        for error in &workflow.errors {
            println!("   • {error}");
        }
    }
}
