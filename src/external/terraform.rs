//! Terraform invocation for the infrastructure step

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::command::{CommandError, CommandExecutor, CommandOutput, Invocation};
use crate::config::TerraformConfig;

/// Name of the rendered root module inside a workspace
pub const ROOT_MODULE_FILE: &str = "main.tf.json";
const PLAN_FILE: &str = "tfplan";

/// What to provision and where
#[derive(Debug, Clone, PartialEq)]
pub struct InfraSpec {
    /// Per-workflow working directory holding the root module and state
    pub workspace: PathBuf,
    /// Per-platform module called by the root module
    pub module_source: PathBuf,
    pub platform: String,
    /// Passed to the platform module as input variables
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionOutcome {
    pub outputs: Map<String, Value>,
    pub success: bool,
    pub logs: Vec<String>,
}

impl ProvisionOutcome {
    fn failed(mut logs: Vec<String>, message: String) -> Self {
        logs.push(message);
        Self {
            outputs: Map::new(),
            success: false,
            logs,
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait InfraProvisioner: Send + Sync {
    /// init, plan, apply and read outputs. Tool-reported failures come back
    /// as `success == false`; `Err` means the tool could not be run at all.
    async fn apply(&self, spec: &InfraSpec) -> Result<ProvisionOutcome, CommandError>;

    /// Tear down whatever `workspace` provisioned
    async fn destroy(&self, workspace: &Path) -> Result<ProvisionOutcome, CommandError>;
}

/// Root module that calls the platform module and re-exports its outputs
pub fn render_root_module(spec: &InfraSpec) -> Value {
    let mut cluster = Map::new();
    cluster.insert(
        "source".to_string(),
        Value::String(spec.module_source.display().to_string()),
    );
    for (name, value) in &spec.variables {
        cluster.insert(name.clone(), value.clone());
    }

    json!({
        "module": { "cluster": cluster },
        "output": {
            "cluster_endpoint": {
                "description": "Kubernetes API endpoint",
                "value": "${module.cluster.cluster_endpoint}"
            },
            "kubeconfig": {
                "description": "Kubeconfig content",
                "value": "${module.cluster.kubeconfig}",
                "sensitive": true
            }
        }
    })
}

/// Runs the `terraform` binary through a `CommandExecutor`
pub struct TerraformCli {
    executor: Arc<dyn CommandExecutor>,
    config: TerraformConfig,
}

impl TerraformCli {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: TerraformConfig) -> Self {
        Self { executor, config }
    }

    async fn run<I, S>(&self, workspace: &Path, args: I) -> Result<CommandOutput, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let invocation = Invocation::new(&self.config.binary)
            .args(args)
            .current_dir(workspace)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_LOG", &self.config.log_level)
            .timeout(Duration::from_secs(self.config.command_timeout_seconds));
        self.executor.execute(&invocation).await
    }

    fn parallelism_flag(&self) -> String {
        format!("-parallelism={}", self.config.parallelism)
    }
}

fn failure_text(output: &CommandOutput) -> &str {
    if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    }
}

/// `terraform output -json` wraps every value as `{"value": .., "sensitive": ..}`
pub fn unwrap_output_values(raw: &str) -> Result<Map<String, Value>, CommandError> {
    let parsed: Map<String, Value> =
        serde_json::from_str(raw).map_err(|e| CommandError::ExecutionFailed {
            message: format!("unreadable terraform output: {e}"),
        })?;

    Ok(parsed
        .into_iter()
        .map(|(name, entry)| match entry {
            Value::Object(mut wrapped) if wrapped.contains_key("value") => {
                (name, wrapped.remove("value").unwrap_or(Value::Null))
            }
            other => (name, other),
        })
        .collect())
}

#[async_trait]
impl InfraProvisioner for TerraformCli {
    async fn apply(&self, spec: &InfraSpec) -> Result<ProvisionOutcome, CommandError> {
        let workspace = spec.workspace.as_path();
        let mut logs = Vec::new();

        info!(platform = %spec.platform, workspace = %workspace.display(), "Initializing Terraform");
        let init = self.run(workspace, ["init", "-input=false", "-no-color"]).await?;
        if !init.success() {
            return Ok(ProvisionOutcome::failed(
                logs,
                format!("Terraform init failed: {}", failure_text(&init)),
            ));
        }
        logs.push("Terraform initialized".to_string());

        let plan_out = format!("-out={PLAN_FILE}");
        let plan = self
            .run(
                workspace,
                [
                    "plan",
                    "-input=false",
                    "-no-color",
                    "-detailed-exitcode",
                    plan_out.as_str(),
                    self.parallelism_flag().as_str(),
                ],
            )
            .await?;
        // -detailed-exitcode: 0 no changes, 1 error, 2 changes present
        match plan.status_code {
            0 => logs.push("Terraform plan created (no changes)".to_string()),
            2 => logs.push("Terraform plan created (changes detected)".to_string()),
            _ => {
                return Ok(ProvisionOutcome::failed(
                    logs,
                    format!("Terraform plan failed: {}", failure_text(&plan)),
                ))
            }
        }

        let apply = self
            .run(
                workspace,
                [
                    "apply",
                    "-input=false",
                    "-no-color",
                    "-auto-approve",
                    self.parallelism_flag().as_str(),
                    PLAN_FILE,
                ],
            )
            .await?;
        if !apply.success() {
            return Ok(ProvisionOutcome::failed(
                logs,
                format!("Terraform apply failed: {}", failure_text(&apply)),
            ));
        }
        logs.push("Infrastructure provisioned".to_string());

        let output = self.run(workspace, ["output", "-json", "-no-color"]).await?;
        if !output.success() {
            return Ok(ProvisionOutcome::failed(
                logs,
                format!("Terraform output failed: {}", failure_text(&output)),
            ));
        }
        let outputs = unwrap_output_values(&output.stdout)?;
        logs.push(format!("Retrieved {} Terraform outputs", outputs.len()));

        Ok(ProvisionOutcome {
            outputs,
            success: true,
            logs,
        })
    }

    async fn destroy(&self, workspace: &Path) -> Result<ProvisionOutcome, CommandError> {
        if !workspace.join(ROOT_MODULE_FILE).exists() {
            warn!(workspace = %workspace.display(), "No Terraform workspace to destroy");
            return Ok(ProvisionOutcome::failed(
                Vec::new(),
                format!("No Terraform workspace at {}", workspace.display()),
            ));
        }

        let destroy = self
            .run(
                workspace,
                ["destroy", "-input=false", "-no-color", "-auto-approve"],
            )
            .await?;
        if !destroy.success() {
            return Ok(ProvisionOutcome::failed(
                Vec::new(),
                format!("Terraform destroy failed: {}", failure_text(&destroy)),
            ));
        }

        Ok(ProvisionOutcome {
            outputs: Map::new(),
            success: true,
            logs: vec!["Infrastructure destroyed".to_string()],
        })
    }
}
