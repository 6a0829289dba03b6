use anyhow::Result;
use serde_json::{json, Map, Value};

use super::{print_workflow, with_mode, Command};
use crate::config::AgentConfig;
use crate::orchestrator::Orchestrator;
use crate::state::WorkflowStatus;

pub struct CreateCommand {
    pub platform: String,
    pub environment: String,
    pub nodes: Option<u64>,
    pub region: Option<String>,
    pub monitoring: bool,
    pub workflow_id: Option<String>,
    config: AgentConfig,
}

impl CreateCommand {
    pub fn new(platform: String, environment: String, config: AgentConfig) -> Self {
        Self {
            platform,
            environment,
            nodes: None,
            region: None,
            monitoring: true,
            workflow_id: None,
            config,
        }
    }

    pub fn with_nodes(mut self, nodes: Option<u64>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_monitoring(mut self, monitoring: bool) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: Option<String>) -> Self {
        self.workflow_id = workflow_id;
        self
    }

    pub fn with_real_mode(mut self, real: bool) -> Self {
        self.config = with_mode(self.config, real);
        self
    }

    /// The request as stored in the workflow's `config`
    pub fn request(&self) -> Value {
        let mut request = Map::new();
        request.insert("platform".into(), json!(self.platform));
        request.insert("environment".into(), json!(self.environment));
        if let Some(nodes) = self.nodes {
            request.insert("nodes".into(), json!(nodes));
        }
        if let Some(region) = &self.region {
            request.insert("region".into(), json!(region));
        }
        request.insert("monitoring".into(), json!({"enabled": self.monitoring}));
        Value::Object(request)
    }
}

impl Command for CreateCommand {
    async fn execute(&self) -> Result<()> {
        println!(
            "🚀 Creating {} cluster for {} ({} mode)",
            self.platform,
            self.environment,
            self.config.app.deployment_mode.as_str()
        );
        println!();

        let orchestrator = Orchestrator::from_config(&self.config).await?;
        let workflow = orchestrator
            .run(
                &self.platform,
                &self.environment,
                self.request(),
                self.workflow_id.as_deref(),
            )
            .await?;
        let executions = orchestrator
            .state()
            .list_executions(&workflow.workflow_id)
            .await?;

        print_workflow(&workflow, &executions);
        println!();

        if workflow.status == WorkflowStatus::Failed {
            println!("❌ Deployment failed. Inspect with: terraform-k8s-agent status {}", workflow.workflow_id);
            std::process::exit(1);
        }

        println!("🎉 Deployment complete: {}", workflow.workflow_id);
        if let Some(path) = workflow
            .outputs
            .get("documentation")
            .and_then(|d| d.get("docs_dir"))
            .and_then(Value::as_str)
        {
            println!("📚 Documentation: {path}");
        }
        Ok(())
    }
}
