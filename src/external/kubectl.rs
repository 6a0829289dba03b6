//! Cluster inspection and manifest application through `kubectl`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::command::{CommandError, CommandExecutor, Invocation};
use crate::config::KubernetesConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    pub namespace: String,
    pub phase: String,
}

impl PodStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self.phase.as_str(), "Running" | "Succeeded")
    }
}

/// Snapshot of nodes and pods
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub nodes: Vec<NodeStatus>,
    pub pods: Vec<PodStatus>,
}

impl ClusterHealth {
    pub fn ready_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.ready).count()
    }

    pub fn healthy_pods(&self) -> usize {
        self.pods.iter().filter(|p| p.is_healthy()).count()
    }

    pub fn pods_in(&self, namespace: &str) -> impl Iterator<Item = &PodStatus> {
        let namespace = namespace.to_string();
        self.pods.iter().filter(move |p| p.namespace == namespace)
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ClusterInspector: Send + Sync {
    async fn check(&self, kubeconfig: Option<PathBuf>) -> Result<ClusterHealth, CommandError>;

    /// Apply every manifest in `dir`; returns the applied resource names
    async fn apply_manifests(
        &self,
        kubeconfig: Option<PathBuf>,
        dir: PathBuf,
    ) -> Result<Vec<String>, CommandError>;
}

pub struct KubectlCli {
    executor: Arc<dyn CommandExecutor>,
    config: KubernetesConfig,
}

impl KubectlCli {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: KubernetesConfig) -> Self {
        Self { executor, config }
    }

    async fn run_json(&self, kubeconfig: &Option<PathBuf>, args: &[&str]) -> Result<Value, CommandError> {
        let stdout = self.run(kubeconfig, args).await?;
        serde_json::from_str(&stdout).map_err(|e| CommandError::ExecutionFailed {
            message: format!("unreadable kubectl output: {e}"),
        })
    }

    async fn run(&self, kubeconfig: &Option<PathBuf>, args: &[&str]) -> Result<String, CommandError> {
        let mut invocation = Invocation::new(&self.config.kubectl_binary)
            .args(args.iter().copied())
            .timeout(Duration::from_secs(self.config.command_timeout_seconds));

        let kubeconfig = kubeconfig
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| self.config.kubeconfig.clone());
        if let Some(path) = kubeconfig {
            invocation = invocation.arg("--kubeconfig").arg(path);
        }

        let output = self.executor.execute(&invocation).await?;
        if !output.success() {
            return Err(CommandError::ExecutionFailed {
                message: format!("{} failed: {}", invocation.command_line(), output.stderr.trim()),
            });
        }
        Ok(output.stdout)
    }
}

pub fn parse_nodes(list: &Value) -> Vec<NodeStatus> {
    items(list)
        .map(|node| NodeStatus {
            name: str_at(node, &["metadata", "name"]).unwrap_or_default(),
            ready: node
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .map(|conditions| {
                    conditions.iter().any(|c| {
                        c.get("type").and_then(Value::as_str) == Some("Ready")
                            && c.get("status").and_then(Value::as_str) == Some("True")
                    })
                })
                .unwrap_or(false),
            version: str_at(node, &["status", "nodeInfo", "kubeletVersion"]),
        })
        .collect()
}

pub fn parse_pods(list: &Value) -> Vec<PodStatus> {
    items(list)
        .map(|pod| PodStatus {
            name: str_at(pod, &["metadata", "name"]).unwrap_or_default(),
            namespace: str_at(pod, &["metadata", "namespace"]).unwrap_or_else(|| "default".into()),
            phase: str_at(pod, &["status", "phase"]).unwrap_or_else(|| "Unknown".into()),
        })
        .collect()
}

fn items(list: &Value) -> impl Iterator<Item = &Value> {
    list.get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl ClusterInspector for KubectlCli {
    async fn check(&self, kubeconfig: Option<PathBuf>) -> Result<ClusterHealth, CommandError> {
        let nodes = self
            .run_json(&kubeconfig, &["get", "nodes", "-o", "json"])
            .await?;
        let pods = self
            .run_json(&kubeconfig, &["get", "pods", "--all-namespaces", "-o", "json"])
            .await?;

        let health = ClusterHealth {
            nodes: parse_nodes(&nodes),
            pods: parse_pods(&pods),
        };
        debug!(
            nodes = health.nodes.len(),
            ready = health.ready_nodes(),
            pods = health.pods.len(),
            "Cluster inspected"
        );
        Ok(health)
    }

    async fn apply_manifests(
        &self,
        kubeconfig: Option<PathBuf>,
        dir: PathBuf,
    ) -> Result<Vec<String>, CommandError> {
        let dir = dir.display().to_string();
        let stdout = self
            .run(&kubeconfig, &["apply", "-f", dir.as_str(), "-o", "name"])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
