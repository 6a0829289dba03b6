use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::monitoring::MONITORING_NAMESPACE;
use super::{StepFailure, StepInput, StepOutput, StepResult, StepRunner};
use crate::external::{ClusterHealth, ClusterInspector};

/// Health score below which the deployment is rejected
pub const MIN_HEALTH_SCORE: u32 = 80;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, passed: bool, detail: String) -> Self {
        Self { name, passed, detail }
    }
}

pub fn run_checks(health: &ClusterHealth, monitoring_expected: bool) -> Vec<Check> {
    let total_nodes = health.nodes.len();
    let ready_nodes = health.ready_nodes();
    let mut checks = vec![
        Check::new(
            "nodes",
            total_nodes > 0 && ready_nodes == total_nodes,
            format!("{ready_nodes}/{total_nodes} nodes ready"),
        ),
        Check::new(
            "pods",
            health.healthy_pods() == health.pods.len(),
            format!("{}/{} pods healthy", health.healthy_pods(), health.pods.len()),
        ),
    ];

    if monitoring_expected {
        let pods: Vec<_> = health.pods_in(MONITORING_NAMESPACE).collect();
        let healthy = pods.iter().filter(|p| p.is_healthy()).count();
        checks.push(Check::new(
            "monitoring",
            !pods.is_empty() && healthy == pods.len(),
            format!("{healthy}/{} monitoring pods healthy", pods.len()),
        ));
    }

    let dns_ready = health
        .pods_in("kube-system")
        .any(|p| p.name.starts_with("coredns") && p.is_healthy());
    checks.push(Check::new(
        "networking",
        dns_ready,
        if dns_ready {
            "cluster DNS running".to_string()
        } else {
            "no healthy coredns pod in kube-system".to_string()
        },
    ));

    checks
}

/// Percentage of passed checks, rounded down
pub fn health_score(checks: &[Check]) -> u32 {
    if checks.is_empty() {
        return 0;
    }
    let passed = checks.iter().filter(|c| c.passed).count();
    (passed * 100 / checks.len()) as u32
}

pub struct ValidationStep {
    inspector: Arc<dyn ClusterInspector>,
}

impl ValidationStep {
    pub fn new(inspector: Arc<dyn ClusterInspector>) -> Self {
        Self { inspector }
    }
}

#[async_trait]
impl StepRunner for ValidationStep {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn run(&self, input: &StepInput) -> StepResult {
        let mut logs = Vec::new();
        let health = match self.inspector.check(input.kubeconfig_path()).await {
            Ok(health) => health,
            Err(e) => return Err(StepFailure::new(format!("Cluster inspection failed: {e}"), logs)),
        };

        let monitoring_expected = input
            .previous("monitoring")
            .and_then(|m| m.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let checks = run_checks(&health, monitoring_expected);
        let score = health_score(&checks);
        for check in &checks {
            logs.push(format!(
                "{} {}: {}",
                if check.passed { "PASS" } else { "FAIL" },
                check.name,
                check.detail
            ));
        }
        logs.push(format!("Health score: {score}"));

        let all_nodes_ready = !health.nodes.is_empty() && health.ready_nodes() == health.nodes.len();
        if score < MIN_HEALTH_SCORE || !all_nodes_ready {
            warn!(workflow_id = %input.workflow_id, score, all_nodes_ready, "Cluster validation failed");
            return Err(StepFailure::new(
                format!(
                    "Cluster validation failed: health score {score}, {}/{} nodes ready",
                    health.ready_nodes(),
                    health.nodes.len()
                ),
                logs,
            ));
        }

        info!(workflow_id = %input.workflow_id, score, "Cluster validated");
        Ok(StepOutput {
            data: json!({
                "health_score": score,
                "checks": checks,
                "nodes": {"total": health.nodes.len(), "ready": health.ready_nodes()},
                "pods": {"total": health.pods.len(), "healthy": health.healthy_pods()},
                "summary": format!("Cluster healthy (score {score})"),
            }),
            logs,
        })
    }
}
