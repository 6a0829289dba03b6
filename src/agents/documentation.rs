use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

use super::monitoring::MONITORING_NAMESPACE;
use super::{str_or, StepFailure, StepInput, StepOutput, StepResult, StepRunner};

/// Writes operator-facing documentation for a finished deployment
pub struct DocumentationStep {
    output_dir: PathBuf,
}

impl DocumentationStep {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }
}

fn display(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "n/a".to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn render_readme(input: &StepInput) -> String {
    let config = input.effective_config();
    let platform = str_or(config, "platform", "k3s");
    let environment = str_or(config, "environment", "development");
    let infra = input.previous("infrastructure");
    let monitoring = input.previous("monitoring");
    let validation = input.previous("validation");

    let mut readme = format!("# Deployment {}\n\n", input.workflow_id);
    readme.push_str("| Setting | Value |\n|---------|-------|\n");
    readme.push_str(&format!("| Platform | {platform} |\n"));
    readme.push_str(&format!("| Environment | {environment} |\n"));
    readme.push_str(&format!("| Nodes | {} |\n", display(config.get("nodes"))));
    readme.push_str(&format!(
        "| Endpoint | {} |\n",
        display(infra.and_then(|i| i.get("cluster_endpoint")))
    ));

    readme.push_str("\n## Access\n\n");
    match infra
        .and_then(|i| i.get("kubeconfig_path"))
        .and_then(Value::as_str)
    {
        Some(path) => readme.push_str(&format!(
            "```sh\nexport KUBECONFIG={path}\nkubectl get nodes\n```\n"
        )),
        None => readme.push_str("No kubeconfig was produced for this deployment.\n"),
    }

    readme.push_str("\n## Monitoring\n\n");
    if monitoring_deployed(monitoring) {
        readme.push_str(&format!(
            "- Grafana: {}\n- Prometheus: {}\n- Retention: {}\n",
            display(monitoring.and_then(|m| m.get("grafana_url"))),
            display(monitoring.and_then(|m| m.get("prometheus_url"))),
            display(monitoring.and_then(|m| m.get("retention"))),
        ));
    } else {
        readme.push_str("Monitoring is not deployed.\n");
    }

    readme.push_str("\n## Validation\n\n");
    match validation {
        Some(v) => {
            readme.push_str(&format!("Health score: {}\n\n", display(v.get("health_score"))));
            for check in v.get("checks").and_then(Value::as_array).into_iter().flatten() {
                let mark = if check.get("passed").and_then(Value::as_bool).unwrap_or(false) {
                    "x"
                } else {
                    " "
                };
                readme.push_str(&format!(
                    "- [{mark}] {}: {}\n",
                    display(check.get("name")),
                    display(check.get("detail"))
                ));
            }
        }
        None => readme.push_str("Validation did not complete.\n"),
    }

    readme.push_str("\nSee [RUNBOOK.md](RUNBOOK.md) for day-to-day operations.\n");
    readme.push_str(&format!(
        "\n## Teardown\n\n```sh\nterraform-k8s-agent destroy {}\n```\n",
        input.workflow_id
    ));
    readme
}

fn monitoring_deployed(monitoring: Option<&Value>) -> bool {
    monitoring
        .and_then(|m| m.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Operational procedures for the deployed cluster
pub fn render_runbook(input: &StepInput) -> String {
    let infra = input.previous("infrastructure");
    let monitoring = input.previous("monitoring");

    let mut runbook = format!("# Runbook for {}\n\n", input.workflow_id);
    if let Some(path) = infra
        .and_then(|i| i.get("kubeconfig_path"))
        .and_then(Value::as_str)
    {
        runbook.push_str(&format!("All commands assume `export KUBECONFIG={path}`.\n\n"));
    }

    runbook.push_str(
        "## Daily checks\n\n```sh\nkubectl get nodes\nkubectl get pods -n kube-system\n\
         kubectl get events --sort-by='.lastTimestamp'\n```\n",
    );

    if monitoring_deployed(monitoring) {
        runbook.push_str(&format!(
            "\n## Monitoring\n\nNamespace `{MONITORING_NAMESPACE}`.\n\n\
             - Grafana ({}): keep CPU below 80% and memory below 85%.\n\
             - Prometheus ({}): every scrape target should be UP.\n\n\
             ```sh\nkubectl get pods -n {MONITORING_NAMESPACE}\n\
             kubectl rollout restart deployment/prometheus -n {MONITORING_NAMESPACE}\n```\n",
            display(monitoring.and_then(|m| m.get("grafana_url"))),
            display(monitoring.and_then(|m| m.get("prometheus_url"))),
        ));
    }

    runbook.push_str(
        "\n## Node not ready\n\n```sh\nkubectl describe node <node>\n\
         kubectl drain <node> --ignore-daemonsets --delete-emptydir-data\n```\n",
    );
    runbook.push_str(
        "\n## Pod crash looping\n\n```sh\nkubectl get pods --all-namespaces | grep -v Running\n\
         kubectl logs <pod> -n <namespace> --previous\nkubectl describe pod <pod> -n <namespace>\n```\n",
    );
    runbook.push_str(&format!(
        "\n## Stuck workflow\n\n```sh\nterraform-k8s-agent status {wf}\n\
         terraform-k8s-agent fail-execution <execution-id> --reason \"<why>\"\n\
         terraform-k8s-agent destroy {wf}\n```\n",
        wf = input.workflow_id
    ));
    runbook
}

#[async_trait]
impl StepRunner for DocumentationStep {
    fn name(&self) -> &'static str {
        "documentation"
    }

    async fn run(&self, input: &StepInput) -> StepResult {
        let dir = self.output_dir.join("docs").join(&input.workflow_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StepFailure::new(format!("Could not create {}: {e}", dir.display()), vec![]))?;

        let readme_path = dir.join("README.md");
        tokio::fs::write(&readme_path, render_readme(input))
            .await
            .map_err(|e| StepFailure::new(format!("Could not write README: {e}"), vec![]))?;

        let runbook_path = dir.join("RUNBOOK.md");
        tokio::fs::write(&runbook_path, render_runbook(input))
            .await
            .map_err(|e| StepFailure::new(format!("Could not write runbook: {e}"), vec![]))?;

        let deployment = json!({
            "workflow_id": input.workflow_id,
            "config": input.effective_config(),
            "steps": input.previous_outputs,
        });
        let deployment_path = dir.join("deployment.json");
        let body = serde_json::to_string_pretty(&deployment)
            .map_err(|e| StepFailure::new(e.to_string(), vec![]))?;
        tokio::fs::write(&deployment_path, body)
            .await
            .map_err(|e| StepFailure::new(format!("Could not write deployment summary: {e}"), vec![]))?;

        info!(workflow_id = %input.workflow_id, dir = %dir.display(), "Documentation generated");
        Ok(StepOutput {
            data: json!({
                "docs_dir": dir.display().to_string(),
                "files": [
                    readme_path.display().to_string(),
                    runbook_path.display().to_string(),
                    deployment_path.display().to_string(),
                ],
                "summary": "Documentation generated",
            }),
            logs: vec![format!("Documentation written to {}", dir.display())],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn finished_input() -> StepInput {
        let mut previous = Map::new();
        previous.insert(
            "infrastructure".into(),
            json!({"cluster_endpoint": "https://localhost:6443", "kubeconfig_path": "/out/kubeconfigs/wf-1.kubeconfig"}),
        );
        previous.insert(
            "monitoring".into(),
            json!({"enabled": true, "grafana_url": "http://localhost:3000", "prometheus_url": "http://localhost:9090", "retention": "7d"}),
        );
        previous.insert(
            "validation".into(),
            json!({"health_score": 100, "checks": [{"name": "nodes", "passed": true, "detail": "3/3 nodes ready"}]}),
        );
        StepInput::new("wf-1", json!({"platform": "k3s", "environment": "development", "nodes": 3}), previous)
    }

    #[test]
    fn test_readme_summarises_deployment() {
        let readme = render_readme(&finished_input());
        assert!(readme.starts_with("# Deployment wf-1"));
        assert!(readme.contains("| Endpoint | https://localhost:6443 |"));
        assert!(readme.contains("export KUBECONFIG=/out/kubeconfigs/wf-1.kubeconfig"));
        assert!(readme.contains("- Grafana: http://localhost:3000"));
        assert!(readme.contains("- [x] nodes: 3/3 nodes ready"));
    }

    #[test]
    fn test_readme_without_earlier_outputs() {
        let readme = render_readme(&StepInput::new("wf-2", json!({}), Map::new()));
        assert!(readme.contains("| Endpoint | n/a |"));
        assert!(readme.contains("Monitoring is not deployed."));
        assert!(readme.contains("Validation did not complete."));
    }

    #[test]
    fn test_runbook_covers_monitoring_and_recovery() {
        let runbook = render_runbook(&finished_input());
        assert!(runbook.starts_with("# Runbook for wf-1"));
        assert!(runbook.contains("export KUBECONFIG=/out/kubeconfigs/wf-1.kubeconfig"));
        assert!(runbook.contains("Grafana (http://localhost:3000)"));
        assert!(runbook.contains("kubectl get pods -n monitoring"));
        assert!(runbook.contains("terraform-k8s-agent destroy wf-1"));

        let bare = render_runbook(&StepInput::new("wf-2", json!({}), Map::new()));
        assert!(!bare.contains("## Monitoring"));
        assert!(bare.contains("## Node not ready"));
    }

    #[tokio::test]
    async fn test_writes_docs_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = DocumentationStep::new(dir.path().to_path_buf())
            .run(&finished_input())
            .await
            .unwrap();

        let docs = dir.path().join("docs/wf-1");
        assert!(docs.join("README.md").exists());
        assert!(docs.join("RUNBOOK.md").exists());
        let deployment: Value =
            serde_json::from_str(&std::fs::read_to_string(docs.join("deployment.json")).unwrap()).unwrap();
        assert_eq!(deployment["steps"]["validation"]["health_score"], json!(100));
        assert_eq!(output.data["files"].as_array().unwrap().len(), 3);
    }
}
