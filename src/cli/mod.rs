use clap::{Parser, Subcommand};

pub mod commands;

#[derive(Parser)]
#[command(name = "terraform-k8s-agent")]
#[command(about = "LLM-assisted Kubernetes cluster provisioning with Terraform")]
#[command(long_about = "Plans, provisions, monitors, validates and documents Kubernetes clusters. \
                       Every workflow and step execution is persisted, so 'status' works from any \
                       process. Runs in demo mode unless --real is given.")]
pub struct Cli {
    /// Configuration file layered over defaults and environment
    #[arg(long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a workflow and run it to a final status
    Create {
        /// Target platform
        #[arg(long, default_value = "k3s", help = "Platform: k3s, eks, gke, aks")]
        platform: String,
        /// Target environment
        #[arg(long, default_value = "development", help = "Environment: development, staging, production")]
        environment: String,
        /// Number of nodes
        #[arg(long, help = "Requested node count (production is raised to at least 3)")]
        nodes: Option<u64>,
        /// Cloud region
        #[arg(long, help = "Region passed to the platform module")]
        region: Option<String>,
        /// Skip the monitoring stack
        #[arg(long, help = "Do not deploy Prometheus and Grafana")]
        no_monitoring: bool,
        /// Run terraform and kubectl for real
        #[arg(long, help = "Provision real infrastructure instead of simulating it")]
        real: bool,
        /// Explicit workflow id
        #[arg(long, help = "Workflow id (generated as <platform>-<environment>-<hex> if omitted)")]
        workflow_id: Option<String>,
    },
    /// Show a workflow, its outputs, errors and step executions
    Status {
        /// Workflow to show
        workflow_id: String,
        /// Print the raw records as JSON
        #[arg(long, help = "Output the workflow and executions as JSON")]
        json: bool,
    },
    /// List all workflows in creation order
    List,
    /// Tear down a workflow's infrastructure
    Destroy {
        /// Workflow to tear down
        workflow_id: String,
        /// Run terraform for real
        #[arg(long, help = "Destroy real infrastructure instead of simulating it")]
        real: bool,
    },
    /// Mark a stuck RUNNING execution as FAILED
    FailExecution {
        /// Execution to mark failed
        execution_id: String,
        /// Reason recorded on the execution
        #[arg(long, help = "Why the execution is being failed")]
        reason: String,
    },
    /// Print the effective configuration, or save it as TOML
    Config {
        /// Output file path (default: stdout)
        #[arg(long, help = "File path to write the configuration to")]
        output: Option<String>,
    },
}
