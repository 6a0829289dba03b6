use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::{str_or, StepFailure, StepInput, StepOutput, StepResult, StepRunner};
use crate::config::MonitoringConfig;
use crate::external::ClusterInspector;

pub const MONITORING_NAMESPACE: &str = "monitoring";

const DASHBOARDS: [&str; 3] = ["cluster-overview", "node-metrics", "pod-metrics"];

/// Deploys the Prometheus/Grafana stack as plain Kubernetes manifests
pub struct MonitoringStep {
    inspector: Arc<dyn ClusterInspector>,
    output_dir: PathBuf,
    monitoring: MonitoringConfig,
}

impl MonitoringStep {
    pub fn new(inspector: Arc<dyn ClusterInspector>, output_dir: PathBuf, monitoring: MonitoringConfig) -> Self {
        Self {
            inspector,
            output_dir,
            monitoring,
        }
    }

    fn manifests_dir(&self, workflow_id: &str) -> PathBuf {
        self.output_dir
            .join("manifests")
            .join(workflow_id)
            .join(MONITORING_NAMESPACE)
    }
}

/// Whether the request (or the planner's refinement of it) wants monitoring
pub fn monitoring_enabled(config: &Value) -> bool {
    match config.get("monitoring") {
        Some(Value::Bool(enabled)) => *enabled,
        Some(section) => section.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        None => true,
    }
}

fn alerting_enabled(config: &Value) -> bool {
    config
        .get("monitoring")
        .and_then(|m| m.get("alerting"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Manifests to apply, as (file stem, document) pairs in apply order
pub fn render_manifests(config: &Value, monitoring: &MonitoringConfig) -> Vec<(String, Value)> {
    let retention = config
        .get("monitoring")
        .map(|m| str_or(m, "retention", &monitoring.prometheus_retention))
        .unwrap_or(&monitoring.prometheus_retention)
        .to_string();

    let mut manifests = vec![
        (
            "00-namespace".to_string(),
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": MONITORING_NAMESPACE},
            }),
        ),
        (
            "10-prometheus-config".to_string(),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "prometheus-config", "namespace": MONITORING_NAMESPACE},
                "data": {
                    "retention": retention,
                    "prometheus.yml": "global:\n  scrape_interval: 30s\nscrape_configs:\n- job_name: kubernetes-nodes\n  kubernetes_sd_configs:\n  - role: node\n- job_name: kubernetes-pods\n  kubernetes_sd_configs:\n  - role: pod\n",
                },
            }),
        ),
        (
            "20-grafana-datasource".to_string(),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {
                    "name": "grafana-datasources",
                    "namespace": MONITORING_NAMESPACE,
                    "labels": {"grafana_datasource": "1"},
                },
                "data": {
                    "prometheus.json": json!({
                        "name": "Prometheus",
                        "type": "prometheus",
                        "url": monitoring.prometheus_url,
                        "access": "proxy",
                        "isDefault": true,
                    }).to_string(),
                },
            }),
        ),
    ];

    if alerting_enabled(config) {
        manifests.push((
            "30-alert-rules".to_string(),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "prometheus-alert-rules", "namespace": MONITORING_NAMESPACE},
                "data": {
                    "alerts.yml": "groups:\n- name: cluster\n  rules:\n  - alert: NodeNotReady\n    expr: kube_node_status_condition{condition=\"Ready\",status=\"true\"} == 0\n    for: 5m\n  - alert: PodCrashLooping\n    expr: rate(kube_pod_container_status_restarts_total[15m]) > 0\n    for: 15m\n",
                },
            }),
        ));
    }

    manifests
}

async fn write_manifests(dir: &Path, manifests: &[(String, Value)]) -> Result<(), String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("Could not create {}: {e}", dir.display()))?;
    for (stem, manifest) in manifests {
        let body = serde_json::to_string_pretty(manifest).map_err(|e| e.to_string())?;
        let path = dir.join(format!("{stem}.json"));
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| format!("Could not write {}: {e}", path.display()))?;
    }
    Ok(())
}

#[async_trait]
impl StepRunner for MonitoringStep {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    async fn run(&self, input: &StepInput) -> StepResult {
        let config = input.effective_config();
        if !monitoring_enabled(config) {
            info!(workflow_id = %input.workflow_id, "Monitoring disabled, skipping");
            return Ok(StepOutput {
                data: json!({"enabled": false, "summary": "Monitoring disabled"}),
                logs: vec!["Monitoring disabled by configuration".to_string()],
            });
        }

        let mut logs = Vec::new();
        let dir = self.manifests_dir(&input.workflow_id);
        let manifests = render_manifests(config, &self.monitoring);
        write_manifests(&dir, &manifests)
            .await
            .map_err(|e| StepFailure::new(e, logs.clone()))?;
        logs.push(format!("{} monitoring manifests written to {}", manifests.len(), dir.display()));

        let applied = match self.inspector.apply_manifests(input.kubeconfig_path(), dir.clone()).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(workflow_id = %input.workflow_id, error = %e, "Applying monitoring manifests failed");
                return Err(StepFailure::new(format!("Monitoring deployment failed: {e}"), logs));
            }
        };
        if applied.is_empty() {
            return Err(StepFailure::new("kubectl applied no monitoring resources", logs));
        }
        logs.extend(applied.iter().map(|name| format!("Applied {name}")));

        let retention = manifests
            .iter()
            .find(|(stem, _)| stem == "10-prometheus-config")
            .and_then(|(_, m)| m["data"]["retention"].as_str())
            .unwrap_or(&self.monitoring.prometheus_retention)
            .to_string();

        Ok(StepOutput {
            data: json!({
                "enabled": true,
                "manifests_dir": dir.display().to_string(),
                "applied": applied,
                "prometheus_deployed": true,
                "grafana_deployed": true,
                "grafana_url": self.monitoring.grafana_url,
                "prometheus_url": self.monitoring.prometheus_url,
                "retention": retention,
                "dashboards": DASHBOARDS,
                "summary": "Monitoring stack deployed",
            }),
            logs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::external::{CommandError, MockClusterInspector, SimulatedInspector};
    use serde_json::Map;

    fn input(context: Value) -> StepInput {
        StepInput::new("wf-1", context, Map::new())
    }

    #[test]
    fn test_monitoring_enabled_forms() {
        assert!(monitoring_enabled(&json!({})));
        assert!(monitoring_enabled(&json!({"monitoring": true})));
        assert!(!monitoring_enabled(&json!({"monitoring": false})));
        assert!(!monitoring_enabled(&json!({"monitoring": {"enabled": false}})));
        assert!(monitoring_enabled(&json!({"monitoring": {"retention": "7d"}})));
    }

    #[test]
    fn test_render_uses_requested_retention_and_alerting() {
        let config = json!({"monitoring": {"enabled": true, "retention": "7d", "alerting": true}});
        let manifests = render_manifests(&config, &AgentConfig::default().monitoring);
        assert_eq!(manifests.len(), 4);
        assert_eq!(manifests[1].1["data"]["retention"], json!("7d"));
        assert_eq!(manifests[3].0, "30-alert-rules");

        let manifests = render_manifests(&json!({}), &AgentConfig::default().monitoring);
        assert_eq!(manifests.len(), 3);
        assert_eq!(manifests[1].1["data"]["retention"], json!("15d"));
    }

    #[tokio::test]
    async fn test_disabled_monitoring_succeeds_without_applying() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = MockClusterInspector::new();
        let step = MonitoringStep::new(Arc::new(inspector), dir.path().to_path_buf(), AgentConfig::default().monitoring);

        let output = step.run(&input(json!({"monitoring": {"enabled": false}}))).await.unwrap();
        assert_eq!(output.data["enabled"], json!(false));
        assert!(!dir.path().join("manifests").exists());
    }

    #[tokio::test]
    async fn test_deploys_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let step = MonitoringStep::new(
            Arc::new(SimulatedInspector),
            dir.path().to_path_buf(),
            AgentConfig::default().monitoring,
        );

        let output = step.run(&input(json!({"platform": "k3s"}))).await.unwrap();
        assert_eq!(output.data["enabled"], json!(true));
        assert_eq!(
            output.data["applied"],
            json!([
                "manifest/00-namespace",
                "manifest/10-prometheus-config",
                "manifest/20-grafana-datasource"
            ])
        );
        assert_eq!(output.data["grafana_url"], json!("http://localhost:3000"));
        assert!(dir.path().join("manifests/wf-1/monitoring/00-namespace.json").exists());
    }

    #[tokio::test]
    async fn test_kubectl_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut inspector = MockClusterInspector::new();
        inspector.expect_apply_manifests().returning(|_, _| {
            Err(CommandError::ExecutionFailed {
                message: "connection refused".to_string(),
            })
        });
        let step = MonitoringStep::new(Arc::new(inspector), dir.path().to_path_buf(), AgentConfig::default().monitoring);

        let failure = step.run(&input(json!({}))).await.unwrap_err();
        assert!(failure.message.contains("connection refused"));
    }
}
