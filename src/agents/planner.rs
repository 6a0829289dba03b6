use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

use super::{str_or, StepFailure, StepInput, StepOutput, StepResult, StepRunner};
use crate::config::LlmConfig;
use crate::llm::LlmClient;

/// Asks the LLM for an optimized cluster configuration and derives the
/// execution plan from it. Falls back to per-environment defaults whenever
/// the LLM is unavailable or answers with something other than a JSON object.
pub struct PlannerStep {
    llm: Arc<dyn LlmClient>,
    config: LlmConfig,
}

impl PlannerStep {
    pub fn new(llm: Arc<dyn LlmClient>, config: LlmConfig) -> Self {
        Self { llm, config }
    }
}

pub fn build_prompt(platform: &str, environment: &str, context: &Value) -> String {
    let current = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
    format!(
        "You are a Kubernetes infrastructure expert. Optimize the following configuration \
for a {platform} cluster in {environment} environment.

Current configuration:
{current}

Provide an optimized configuration considering resource sizing, high availability, \
security, cost and observability.

Return ONLY a JSON object with the optimized configuration."
    )
}

/// Body of the first markdown code fence, with or without a `json` tag
static FENCED_JSON: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```"));

/// Pull a JSON object out of a completion, tolerating markdown fences and prose
pub fn parse_llm_json(text: &str) -> Option<Map<String, Value>> {
    let fenced = match FENCED_JSON.as_ref() {
        Ok(re) => re
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string()),
        Err(e) => {
            warn!(error = %e, "Fence pattern failed to compile, parsing raw text only");
            None
        }
    };

    let mut candidates = Vec::new();
    if let Some(fenced) = fenced {
        candidates.push(fenced);
    }
    candidates.push(text.trim().to_string());
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            candidates.push(text[start..=end].to_string());
        }
    }

    candidates
        .iter()
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

pub fn default_config(platform: &str, environment: &str, nodes: u64) -> Map<String, Value> {
    let eks = platform == "eks";
    let resources = match environment {
        "production" => json!({
            "instance_type": if eks { "t3.xlarge" } else { "Standard_D2s_v3" },
            "disk_size": 200,
            "memory": "16Gi",
            "cpu": 4,
        }),
        "staging" => json!({
            "instance_type": if eks { "t3.large" } else { "Standard_B2ms" },
            "disk_size": 100,
            "memory": "8Gi",
            "cpu": 2,
        }),
        _ => json!({
            "instance_type": if eks { "t3.medium" } else { "Standard_B2s" },
            "disk_size": 50,
            "memory": "4Gi",
            "cpu": 2,
        }),
    };
    let production = environment == "production";
    let hardened = matches!(environment, "staging" | "production");

    let mut config = json!({
        "platform": platform,
        "environment": environment,
        "nodes": nodes,
        "kubernetes_version": "1.28",
        "resources": resources,
        "networking": {
            "pod_cidr": "10.244.0.0/16",
            "service_cidr": "10.96.0.0/16",
        },
        "monitoring": {
            "enabled": true,
            "retention": if production { "15d" } else { "7d" },
            "alerting": production,
        },
        "security": {
            "rbac_enabled": true,
            "network_policies": hardened,
            "pod_security_policy": production,
        },
        "addons": {
            "metrics_server": true,
            "ingress_nginx": true,
            "cert_manager": hardened,
        },
    });

    let platform_config = match platform {
        "k3s" => Some((
            "k3s_config",
            json!({"disable": ["traefik"], "write_kubeconfig_mode": "644"}),
        )),
        "eks" => Some((
            "eks_config",
            json!({
                "region": "us-east-1",
                "availability_zones": ["us-east-1a", "us-east-1b", "us-east-1c"],
            }),
        )),
        "aks" => Some((
            "aks_config",
            json!({"location": "eastus", "sku_tier": if production { "Standard" } else { "Free" }}),
        )),
        _ => None,
    };
    if let (Some((key, value)), Some(map)) = (platform_config, config.as_object_mut()) {
        map.insert(key.to_string(), value);
    }

    match config {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else replaces
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

pub fn execution_plan(platform: &str, environment: &str, config: &Value) -> Value {
    let mut steps = vec![json!({
        "name": "infrastructure",
        "description": format!("Provisioning {platform} cluster"),
        "tasks": [
            "Initialize Terraform",
            "Create network resources",
            "Provision compute instances",
            "Configure Kubernetes",
        ],
        "estimated_time": if platform == "k3s" { 5 } else { 15 },
    })];

    let monitoring = config.get("monitoring");
    let flag = |section: Option<&Value>, key: &str| {
        section
            .and_then(|s| s.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };
    if flag(monitoring, "enabled") {
        let mut tasks = vec!["Deploy Prometheus", "Deploy Grafana", "Import dashboards"];
        if flag(monitoring, "alerting") {
            tasks.push("Setup alerts");
        }
        steps.push(json!({
            "name": "monitoring",
            "description": "Setup monitoring stack",
            "tasks": tasks,
            "estimated_time": 3,
        }));
    }

    let addon_tasks: Vec<String> = config
        .get("addons")
        .and_then(Value::as_object)
        .map(|addons| {
            addons
                .iter()
                .filter(|(_, enabled)| enabled.as_bool().unwrap_or(false))
                .map(|(addon, _)| format!("Install {addon}"))
                .collect()
        })
        .unwrap_or_default();
    if !addon_tasks.is_empty() {
        steps.push(json!({
            "name": "addons",
            "description": "Install cluster addons",
            "tasks": addon_tasks,
            "estimated_time": 2,
        }));
    }

    steps.push(json!({
        "name": "validation",
        "description": "Validate cluster",
        "tasks": [
            "Check node status",
            "Verify pod health",
            "Test monitoring endpoints",
            "Validate networking",
        ],
        "estimated_time": 2,
    }));

    json!({
        "platform": platform,
        "environment": environment,
        "total_steps": steps.len(),
        "steps": steps,
    })
}

pub fn estimate(plan: &Value) -> Value {
    let steps = plan.get("steps").and_then(Value::as_array);
    let total: u64 = steps
        .map(|steps| {
            steps
                .iter()
                .filter_map(|s| s.get("estimated_time").and_then(Value::as_u64))
                .sum()
        })
        .unwrap_or(0);
    let complexity = match total {
        t if t < 10 => "low",
        t if t < 20 => "medium",
        _ => "high",
    };

    json!({
        "time": total,
        "time_unit": "minutes",
        "steps": steps.map(Vec::len).unwrap_or(0),
        "complexity": complexity,
    })
}

/// Errors make the plan unusable; warnings are reported alongside it
pub fn validate_plan(plan: &Value) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let steps = plan
        .get("steps")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if steps.is_empty() {
        errors.push("Execution plan has no steps".to_string());
    }
    for step in &steps {
        let has_tasks = step
            .get("tasks")
            .and_then(Value::as_array)
            .is_some_and(|tasks| !tasks.is_empty());
        if !has_tasks {
            warnings.push(format!("Step '{}' has no tasks", str_or(step, "name", "?")));
        }
    }
    (errors, warnings)
}

#[async_trait]
impl StepRunner for PlannerStep {
    fn name(&self) -> &'static str {
        "planner"
    }

    async fn run(&self, input: &StepInput) -> StepResult {
        let context = &input.context;
        let platform = str_or(context, "platform", "k3s").to_string();
        let environment = str_or(context, "environment", "development").to_string();
        let requested_nodes = context.get("nodes").and_then(Value::as_u64).unwrap_or(1);
        let mut logs = vec![format!("Analyzing requirements for {platform} ({environment})")];

        let prompt = build_prompt(&platform, &environment, context);
        let base = match self.llm.complete(&prompt, &self.config).await {
            Ok(text) => match parse_llm_json(&text) {
                Some(optimized) => {
                    logs.push(format!("Configuration optimized for {platform} by {}", self.config.provider.as_str()));
                    optimized
                }
                None => {
                    warn!(workflow_id = %input.workflow_id, "LLM answer was not a JSON object, using defaults");
                    logs.push("LLM answer was not a JSON object, using defaults".to_string());
                    default_config(&platform, &environment, requested_nodes)
                }
            },
            Err(e) => {
                warn!(workflow_id = %input.workflow_id, error = %e, "LLM optimization failed, using defaults");
                logs.push(format!("LLM optimization failed, using defaults: {e}"));
                default_config(&platform, &environment, requested_nodes)
            }
        };

        // Explicit request fields override whatever was suggested
        let mut optimized = Value::Object(base);
        deep_merge(&mut optimized, context);
        if let Some(map) = optimized.as_object_mut() {
            map.entry("platform").or_insert_with(|| json!(platform));
            map.entry("environment").or_insert_with(|| json!(environment));
            let nodes = map.get("nodes").and_then(Value::as_u64).unwrap_or(requested_nodes);
            let nodes = if environment == "production" { nodes.max(3) } else { nodes };
            map.insert("nodes".to_string(), json!(nodes));
        }

        let plan = execution_plan(&platform, &environment, &optimized);
        logs.push("Execution plan generated".to_string());
        let estimates = estimate(&plan);
        logs.push(format!("Estimated time: {} minutes", estimates["time"]));

        let (errors, warnings) = validate_plan(&plan);
        if !errors.is_empty() {
            return Err(StepFailure::new(errors.join("; "), logs));
        }

        let nodes = optimized.get("nodes").cloned().unwrap_or(json!(requested_nodes));
        info!(workflow_id = %input.workflow_id, %platform, %environment, %nodes, "Planning completed");

        Ok(StepOutput {
            data: json!({
                "optimized_config": optimized,
                "execution_plan": plan,
                "estimates": estimates,
                "validation": {"valid": true, "errors": [], "warnings": warnings},
                "summary": format!("Plan for {platform} cluster with {nodes} nodes"),
            }),
            logs,
        })
    }
}
