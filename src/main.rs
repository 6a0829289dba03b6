use anyhow::Result;
use clap::Parser;

use terraform_k8s_agent::cli::commands::{
    config::ConfigCommand, create::CreateCommand, destroy::DestroyCommand,
    fail_execution::FailExecutionCommand, list::ListCommand, status::StatusCommand, Command,
};
use terraform_k8s_agent::cli::{Cli, Commands};
use terraform_k8s_agent::{init_telemetry, AgentConfig};

fn show_how_to_start() {
    println!("☸️  Terraform K8s Agent - LLM-assisted cluster provisioning");
    println!();
    println!("To get started:");
    println!("  🚀 terraform-k8s-agent create --platform k3s   # Plan and provision a cluster");
    println!("  📊 terraform-k8s-agent status <workflow-id>    # Inspect a workflow");
    println!("  📋 terraform-k8s-agent list                    # All workflows");
    println!("  🧨 terraform-k8s-agent destroy <workflow-id>   # Tear a cluster down");
    println!();
    println!("💡 Runs in demo mode until you pass --real or set TK8S__APP__DEPLOYMENT_MODE=real");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    AgentConfig::load_env_file()?;
    let config = match &cli.config {
        Some(path) => AgentConfig::load_from_file(path)?,
        None => AgentConfig::load()?,
    };
    init_telemetry(&config.observability)?;

    match cli.command {
        None => {
            show_how_to_start();
            Ok(())
        }
        Some(Commands::Create {
            platform,
            environment,
            nodes,
            region,
            no_monitoring,
            real,
            workflow_id,
        }) => {
            CreateCommand::new(platform, environment, config)
                .with_nodes(nodes)
                .with_region(region)
                .with_monitoring(!no_monitoring)
                .with_workflow_id(workflow_id)
                .with_real_mode(real)
                .execute()
                .await
        }
        Some(Commands::Status { workflow_id, json }) => {
            StatusCommand::new(workflow_id, config)
                .with_json(json)
                .execute()
                .await
        }
        Some(Commands::List) => ListCommand::new(config).execute().await,
        Some(Commands::Destroy { workflow_id, real }) => {
            DestroyCommand::new(workflow_id, config)
                .with_real_mode(real)
                .execute()
                .await
        }
        Some(Commands::FailExecution {
            execution_id,
            reason,
        }) => {
            FailExecutionCommand::new(execution_id, reason, config)
                .execute()
                .await
        }
        Some(Commands::Config { output }) => ConfigCommand::new(output, config).execute().await,
    }
}
