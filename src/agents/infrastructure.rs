use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::{str_or, StepFailure, StepInput, StepOutput, StepResult, StepRunner};
use crate::external::terraform::{render_root_module, ROOT_MODULE_FILE};
use crate::external::{InfraProvisioner, InfraSpec};

/// Variables forwarded from the plan to the platform module when present
const FORWARDED_VARIABLES: [&str; 3] = ["region", "resources", "networking"];

/// Renders the Terraform workspace for a workflow and provisions it
pub struct InfrastructureStep {
    provisioner: Arc<dyn InfraProvisioner>,
    output_dir: PathBuf,
    terraform_dir: PathBuf,
}

impl InfrastructureStep {
    pub fn new(provisioner: Arc<dyn InfraProvisioner>, output_dir: PathBuf, terraform_dir: PathBuf) -> Self {
        Self {
            provisioner,
            output_dir,
            terraform_dir,
        }
    }

    pub fn workspace_for(output_dir: &Path, workflow_id: &str) -> PathBuf {
        output_dir.join("terraform").join(workflow_id)
    }

    fn spec(&self, workflow_id: &str, config: &Value) -> InfraSpec {
        let platform = str_or(config, "platform", "k3s").to_string();

        let mut variables = Map::new();
        variables.insert("cluster_name".to_string(), json!(format!("tk8s-{workflow_id}")));
        variables.insert(
            "environment".to_string(),
            json!(str_or(config, "environment", "development")),
        );
        variables.insert(
            "nodes".to_string(),
            config.get("nodes").cloned().unwrap_or(json!(3)),
        );
        variables.insert(
            "kubernetes_version".to_string(),
            json!(str_or(config, "kubernetes_version", "1.28")),
        );
        for name in FORWARDED_VARIABLES {
            if let Some(value) = config.get(name) {
                variables.insert(name.to_string(), value.clone());
            }
        }

        InfraSpec {
            workspace: Self::workspace_for(&self.output_dir, workflow_id),
            module_source: absolute(&self.terraform_dir.join(&platform)),
            platform,
            variables,
        }
    }

    async fn save_kubeconfig(&self, workflow_id: &str, content: &str) -> std::io::Result<PathBuf> {
        let dir = self.output_dir.join("kubeconfigs");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{workflow_id}.kubeconfig"));
        tokio::fs::write(&path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        Ok(path)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[async_trait]
impl StepRunner for InfrastructureStep {
    fn name(&self) -> &'static str {
        "infrastructure"
    }

    async fn run(&self, input: &StepInput) -> StepResult {
        let spec = self.spec(&input.workflow_id, input.effective_config());
        let mut logs = Vec::new();
        info!(workflow_id = %input.workflow_id, platform = %spec.platform, "Provisioning infrastructure");

        let root_module = serde_json::to_string_pretty(&render_root_module(&spec))
            .map_err(|e| StepFailure::new(format!("Could not render root module: {e}"), logs.clone()))?;
        if let Err(e) = tokio::fs::create_dir_all(&spec.workspace).await {
            return Err(StepFailure::new(
                format!("Could not create Terraform workspace {}: {e}", spec.workspace.display()),
                logs,
            ));
        }
        if let Err(e) = tokio::fs::write(spec.workspace.join(ROOT_MODULE_FILE), root_module).await {
            return Err(StepFailure::new(format!("Could not write root module: {e}"), logs));
        }
        logs.push(format!("Terraform workspace created: {}", spec.workspace.display()));

        let outcome = match self.provisioner.apply(&spec).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return Err(StepFailure::new(
                    format!("Infrastructure provisioning failed: {e}"),
                    logs,
                ))
            }
        };
        logs.extend(outcome.logs.iter().cloned());
        if !outcome.success {
            let reason = outcome
                .logs
                .last()
                .cloned()
                .unwrap_or_else(|| "Terraform reported failure".to_string());
            return Err(StepFailure::new(reason, logs));
        }

        let mut outputs = outcome.outputs;
        // Keep credentials out of the state store; only the file path is recorded
        let kubeconfig = outputs.remove("kubeconfig");
        let kubeconfig_path = match kubeconfig.as_ref().and_then(Value::as_str) {
            Some(content) if !content.is_empty() => {
                match self.save_kubeconfig(&input.workflow_id, content).await {
                    Ok(path) => {
                        logs.push(format!("Kubeconfig saved: {}", path.display()));
                        Some(path.display().to_string())
                    }
                    Err(e) => {
                        return Err(StepFailure::new(format!("Could not save kubeconfig: {e}"), logs))
                    }
                }
            }
            _ => None,
        };
        let cluster_endpoint = outputs.get("cluster_endpoint").cloned().unwrap_or(Value::Null);

        Ok(StepOutput {
            data: json!({
                "platform": spec.platform,
                "workspace": spec.workspace.display().to_string(),
                "outputs": outputs,
                "kubeconfig_path": kubeconfig_path,
                "cluster_endpoint": cluster_endpoint,
                "summary": format!("{} cluster provisioned", spec.platform),
            }),
            logs,
        })
    }
}
