//! Demo-mode collaborators: nothing is provisioned and no binary is run.

use async_trait::async_trait;
use serde_json::{json, Map};
use std::path::{Path, PathBuf};
use tracing::info;

use super::command::CommandError;
use super::kubectl::{ClusterHealth, ClusterInspector, NodeStatus, PodStatus};
use super::terraform::{InfraProvisioner, InfraSpec, ProvisionOutcome};

pub const DEMO_ENDPOINT: &str = "https://localhost:6443";

const DEMO_KUBECONFIG: &str = "apiVersion: v1
kind: Config
clusters:
- cluster:
    server: https://localhost:6443
  name: k3s-cluster
contexts:
- context:
    cluster: k3s-cluster
    user: k3s-admin
  name: k3s
current-context: k3s
users:
- name: k3s-admin
  user: {}
";

#[derive(Debug, Clone, Default)]
pub struct SimulatedProvisioner;

#[async_trait]
impl InfraProvisioner for SimulatedProvisioner {
    async fn apply(&self, spec: &InfraSpec) -> Result<ProvisionOutcome, CommandError> {
        let nodes = spec.variables.get("nodes").cloned().unwrap_or(json!(3));
        info!(platform = %spec.platform, %nodes, "Simulating cluster provisioning");

        let mut outputs = Map::new();
        outputs.insert("cluster_endpoint".to_string(), json!(DEMO_ENDPOINT));
        outputs.insert("kubeconfig".to_string(), json!(DEMO_KUBECONFIG));

        Ok(ProvisionOutcome {
            outputs,
            success: true,
            logs: vec![
                "Terraform initialized (simulated)".to_string(),
                "Terraform plan created (simulated)".to_string(),
                format!("{} cluster with {} nodes provisioned (simulated)", spec.platform, nodes),
            ],
        })
    }

    async fn destroy(&self, workspace: &Path) -> Result<ProvisionOutcome, CommandError> {
        info!(workspace = %workspace.display(), "Simulating infrastructure teardown");
        Ok(ProvisionOutcome {
            outputs: Map::new(),
            success: true,
            logs: vec!["Infrastructure destroyed (simulated)".to_string()],
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedInspector;

fn demo_pods() -> Vec<PodStatus> {
    let pods = [
        ("kube-system", "coredns-6799fbcd5-x7k2p"),
        ("kube-system", "local-path-provisioner-6c86858495-q9n4d"),
        ("kube-system", "metrics-server-54fd9b65b-l8vzs"),
        ("kube-system", "traefik-7d5f6474df-hr5wt"),
        ("kube-system", "svclb-traefik-k3s-server"),
        ("kube-system", "svclb-traefik-k3s-agent-1"),
        ("kube-system", "svclb-traefik-k3s-agent-2"),
        ("monitoring", "prometheus-server-0"),
        ("monitoring", "grafana-5c9f8d7b6-m2xqz"),
        ("monitoring", "node-exporter-k3s-server"),
        ("monitoring", "node-exporter-k3s-agent-1"),
        ("monitoring", "node-exporter-k3s-agent-2"),
    ];
    pods.iter()
        .map(|(namespace, name)| PodStatus {
            name: name.to_string(),
            namespace: namespace.to_string(),
            phase: "Running".to_string(),
        })
        .collect()
}

#[async_trait]
impl ClusterInspector for SimulatedInspector {
    async fn check(&self, _kubeconfig: Option<PathBuf>) -> Result<ClusterHealth, CommandError> {
        let nodes = ["k3s-server", "k3s-agent-1", "k3s-agent-2"]
            .iter()
            .map(|name| NodeStatus {
                name: name.to_string(),
                ready: true,
                version: Some("v1.28.5+k3s1".to_string()),
            })
            .collect();
        Ok(ClusterHealth {
            nodes,
            pods: demo_pods(),
        })
    }

    /// Reports one resource per manifest file found in `dir`
    async fn apply_manifests(
        &self,
        _kubeconfig: Option<PathBuf>,
        dir: PathBuf,
    ) -> Result<Vec<String>, CommandError> {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CommandError::Io { message: e.to_string() })?;

        let mut applied = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CommandError::Io { message: e.to_string() })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    applied.push(format!("manifest/{stem}"));
                }
            }
        }
        applied.sort();
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_cluster_is_healthy() {
        let health = SimulatedInspector.check(None).await.unwrap();
        assert_eq!(health.ready_nodes(), 3);
        assert_eq!(health.pods.len(), 12);
        assert_eq!(health.pods_in("monitoring").count(), 5);
    }

    #[tokio::test]
    async fn test_simulated_apply_lists_manifest_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("namespace.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let applied = SimulatedInspector
            .apply_manifests(None, dir.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(applied, vec!["manifest/namespace".to_string()]);
    }
}
