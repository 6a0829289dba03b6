//! Drives a workflow through its fixed sequence of steps, recording every
//! transition and execution in the state manager.

use anyhow::Result;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use crate::agents::{
    DocumentationStep, InfrastructureStep, MonitoringStep, PlannerStep, StepInput, StepResult,
    StepRunner, ValidationStep,
};
use crate::config::{AgentConfig, DeploymentMode};
use crate::external::{
    ClusterInspector, CommandExecutor, InfraProvisioner, KubectlCli, ProcessCommandExecutor,
    SimulatedInspector, SimulatedProvisioner, TerraformCli,
};
use crate::llm::HttpLlmClient;
use crate::state::{ExecutionRecord, ExecutionStatus, StateError, StateManager, Workflow, WorkflowStatus};
use crate::telemetry::{generate_correlation_id, step_span, workflow_span};

/// Steps whose failure aborts the workflow
pub const CRITICAL_AGENTS: [&str; 2] = ["planner", "infrastructure"];

/// Agent name used for the teardown audit record
pub const DESTROY_AGENT: &str = "destroy";

pub fn is_critical(agent_name: &str) -> bool {
    CRITICAL_AGENTS.contains(&agent_name)
}

/// Workflow status entered before running the named step
pub fn status_for_step(agent_name: &str) -> Option<WorkflowStatus> {
    match agent_name {
        "planner" => Some(WorkflowStatus::Planning),
        "infrastructure" => Some(WorkflowStatus::Provisioning),
        "monitoring" => Some(WorkflowStatus::Configuring),
        "validation" => Some(WorkflowStatus::Validating),
        "documentation" => Some(WorkflowStatus::Documenting),
        _ => None,
    }
}

/// Result of tearing down a workflow's infrastructure
#[derive(Debug, Clone)]
pub struct DestroyOutcome {
    pub workflow: Workflow,
    pub execution: ExecutionRecord,
}

impl DestroyOutcome {
    pub fn succeeded(&self) -> bool {
        self.execution.status == ExecutionStatus::Succeeded
    }
}

enum StepVerdict {
    Continue,
    Abort,
}

pub struct Orchestrator {
    state: StateManager,
    steps: Vec<Arc<dyn StepRunner>>,
    provisioner: Arc<dyn InfraProvisioner>,
    output_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        state: StateManager,
        steps: Vec<Arc<dyn StepRunner>>,
        provisioner: Arc<dyn InfraProvisioner>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            state,
            steps,
            provisioner,
            output_dir,
        }
    }

    /// Wire the standard five-step plan for the configured deployment mode
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let state = StateManager::open(&config.state).await?;

        let (provisioner, inspector): (Arc<dyn InfraProvisioner>, Arc<dyn ClusterInspector>) =
            match config.app.deployment_mode {
                DeploymentMode::Demo => {
                    info!("Demo mode: infrastructure and cluster calls are simulated");
                    (Arc::new(SimulatedProvisioner), Arc::new(SimulatedInspector))
                }
                DeploymentMode::Real => {
                    let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessCommandExecutor);
                    (
                        Arc::new(TerraformCli::new(executor.clone(), config.terraform.clone())),
                        Arc::new(KubectlCli::new(executor, config.kubernetes.clone())),
                    )
                }
            };

        let output_dir = config.app.output_dir.clone();
        let steps: Vec<Arc<dyn StepRunner>> = vec![
            Arc::new(PlannerStep::new(Arc::new(HttpLlmClient::new()), config.llm.clone())),
            Arc::new(InfrastructureStep::new(
                provisioner.clone(),
                output_dir.clone(),
                config.app.terraform_dir.clone(),
            )),
            Arc::new(MonitoringStep::new(
                inspector.clone(),
                output_dir.clone(),
                config.monitoring.clone(),
            )),
            Arc::new(ValidationStep::new(inspector)),
            Arc::new(DocumentationStep::new(output_dir.clone())),
        ];

        Ok(Self::new(state, steps, provisioner, output_dir))
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Create a workflow for the request and run it to a final status
    pub async fn run(
        &self,
        platform: &str,
        environment: &str,
        config: Value,
        workflow_id: Option<&str>,
    ) -> Result<Workflow, StateError> {
        let workflow = match workflow_id {
            Some(id) => {
                self.state
                    .create_workflow(id, platform, environment, config)
                    .await?
            }
            None => {
                self.state
                    .create_workflow_with_generated_id(platform, environment, config)
                    .await?
            }
        };
        self.execute(&workflow.workflow_id).await
    }

    /// Run the step sequence for an existing PENDING workflow
    pub async fn execute(&self, workflow_id: &str) -> Result<Workflow, StateError> {
        let workflow = self.state.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Pending {
            return Err(StateError::InvalidState(format!(
                "workflow {workflow_id} is {} and cannot be started",
                workflow.status
            )));
        }

        let correlation_id = generate_correlation_id();
        let span = workflow_span(workflow_id, &workflow.platform, &correlation_id);
        let started = std::time::Instant::now();

        let result = self.run_steps(workflow_id).instrument(span).await;
        match result {
            Ok(workflow) => {
                info!(
                    workflow_id,
                    status = %workflow.status,
                    errors = workflow.errors.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Workflow finished"
                );
                Ok(workflow)
            }
            Err(e) => {
                error!(workflow_id, error = %e, "Workflow aborted by a state error");
                // Best effort: the store may be the thing that failed
                if self
                    .state
                    .update_workflow_status(workflow_id, WorkflowStatus::Failed)
                    .await
                    .is_ok()
                {
                    if let Err(append_err) = self
                        .state
                        .append_error(workflow_id, &format!("orchestrator: {e}"))
                        .await
                    {
                        warn!(workflow_id, error = %append_err, "Could not record orchestrator error");
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_steps(&self, workflow_id: &str) -> Result<Workflow, StateError> {
        for step in &self.steps {
            if let StepVerdict::Abort = self.run_step(workflow_id, step.as_ref()).await? {
                return self.state.get_workflow(workflow_id).await;
            }
        }
        self.state
            .update_workflow_status(workflow_id, WorkflowStatus::Completed)
            .await
    }

    async fn run_step(&self, workflow_id: &str, step: &dyn StepRunner) -> Result<StepVerdict, StateError> {
        let name = step.name();
        if let Some(status) = status_for_step(name) {
            self.state.update_workflow_status(workflow_id, status).await?;
        }

        // Re-read so the step sees exactly what is durable
        let current = self.state.get_workflow(workflow_id).await?;
        let input = StepInput::new(workflow_id, step_context(&current), current.outputs.clone());
        let execution = self
            .state
            .start_execution(workflow_id, name, input.to_value())
            .await?;

        let span = step_span(workflow_id, name, &execution.execution_id);
        let result = step.run(&input).instrument(span).await;

        let recorded = self.record_result(workflow_id, name, &execution, result).await;
        if let Err(e) = &recorded {
            self.abandon_execution(&execution, e).await;
        }
        recorded
    }

    async fn record_result(
        &self,
        workflow_id: &str,
        name: &str,
        execution: &ExecutionRecord,
        result: StepResult,
    ) -> Result<StepVerdict, StateError> {
        match result {
            Ok(output) => {
                self.state
                    .complete_execution(&execution.execution_id, output.data.clone(), output.logs)
                    .await?;
                self.state.append_output(workflow_id, name, output.data).await?;
                Ok(StepVerdict::Continue)
            }
            Err(failure) => {
                self.state
                    .fail_execution(&execution.execution_id, &failure.message, failure.logs.clone())
                    .await?;
                self.state
                    .append_error(workflow_id, &format!("{name}: {}", failure.message))
                    .await?;

                if is_critical(name) {
                    warn!(workflow_id, agent_name = name, "Critical step failed, stopping workflow");
                    self.state
                        .update_workflow_status(workflow_id, WorkflowStatus::Failed)
                        .await?;
                    Ok(StepVerdict::Abort)
                } else {
                    warn!(workflow_id, agent_name = name, "Non-critical step failed, continuing");
                    Ok(StepVerdict::Continue)
                }
            }
        }
    }

    /// Best effort: leave no execution RUNNING after a state error
    async fn abandon_execution(&self, execution: &ExecutionRecord, cause: &StateError) {
        match self
            .state
            .fail_execution(&execution.execution_id, &format!("orchestrator: {cause}"), Vec::new())
            .await
        {
            Ok(_) => warn!(
                execution_id = %execution.execution_id,
                agent_name = %execution.agent_name,
                "Marked execution failed after a state error"
            ),
            // Already finished before the error
            Err(StateError::InvalidState(_)) => {}
            Err(e) => warn!(
                execution_id = %execution.execution_id,
                error = %e,
                "Execution may still be RUNNING; use fail-execution to clear it"
            ),
        }
    }

    /// Tear down the workflow's Terraform workspace. The attempt is always
    /// audited as a `destroy` execution; a FAILED workflow whose teardown
    /// succeeds moves to ROLLED_BACK.
    pub async fn destroy(&self, workflow_id: &str) -> Result<DestroyOutcome, StateError> {
        let workflow = self.state.get_workflow(workflow_id).await?;
        let workspace = InfrastructureStep::workspace_for(&self.output_dir, workflow_id);
        let execution = self
            .state
            .start_execution(
                workflow_id,
                DESTROY_AGENT,
                json!({"workflow_id": workflow_id, "workspace": workspace.display().to_string()}),
            )
            .await?;

        let execution = match self.provisioner.destroy(&workspace).await {
            Ok(outcome) if outcome.success => {
                self.state
                    .complete_execution(
                        &execution.execution_id,
                        json!({"workspace": workspace.display().to_string(), "destroyed": true}),
                        outcome.logs,
                    )
                    .await?
            }
            Ok(outcome) => {
                let message = outcome
                    .logs
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "Terraform destroy failed".to_string());
                self.state
                    .fail_execution(&execution.execution_id, &message, outcome.logs)
                    .await?
            }
            Err(e) => {
                self.state
                    .fail_execution(&execution.execution_id, &e.to_string(), Vec::new())
                    .await?
            }
        };

        let destroyed = execution.status == ExecutionStatus::Succeeded;
        let workflow = if destroyed && workflow.status == WorkflowStatus::Failed {
            self.state
                .update_workflow_status(workflow_id, WorkflowStatus::RolledBack)
                .await?
        } else {
            if !destroyed {
                warn!(workflow_id, "Teardown failed; workflow status left unchanged");
            }
            self.state.get_workflow(workflow_id).await?
        };

        Ok(DestroyOutcome { workflow, execution })
    }
}

/// Request config with the workflow's platform and environment filled in
fn step_context(workflow: &Workflow) -> Value {
    let mut context = match &workflow.config {
        Value::Object(map) => map.clone(),
        _ => Default::default(),
    };
    context
        .entry("platform")
        .or_insert_with(|| json!(workflow.platform));
    context
        .entry("environment")
        .or_insert_with(|| json!(workflow.environment));
    Value::Object(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{MockStepRunner, StepFailure, StepOutput};
    use crate::external::MockInfraProvisioner;
    use crate::state::FileBackend;

    fn state(dir: &tempfile::TempDir) -> StateManager {
        StateManager::new(Arc::new(FileBackend::new(dir.path().join("state.json"))))
    }

    fn succeeding(name: &'static str) -> Arc<dyn StepRunner> {
        let mut step = MockStepRunner::new();
        step.expect_name().return_const(name);
        step.expect_run().returning(move |_| {
            Ok(StepOutput {
                data: json!({"step": name}),
                logs: vec![format!("{name} done")],
            })
        });
        Arc::new(step)
    }

    fn failing(name: &'static str) -> Arc<dyn StepRunner> {
        let mut step = MockStepRunner::new();
        step.expect_name().return_const(name);
        step.expect_run()
            .returning(move |_| Err(StepFailure::new(format!("{name} broke"), vec![])));
        Arc::new(step)
    }

    fn never_run(name: &'static str) -> Arc<dyn StepRunner> {
        let mut step = MockStepRunner::new();
        step.expect_name().return_const(name);
        step.expect_run().never();
        Arc::new(step)
    }

    fn orchestrator(dir: &tempfile::TempDir, steps: Vec<Arc<dyn StepRunner>>) -> Orchestrator {
        Orchestrator::new(
            state(dir),
            steps,
            Arc::new(SimulatedProvisioner),
            dir.path().join("output"),
        )
    }

    #[test]
    fn test_criticality_and_status_lookup() {
        assert!(is_critical("planner"));
        assert!(is_critical("infrastructure"));
        assert!(!is_critical("monitoring"));
        assert_eq!(status_for_step("validation"), Some(WorkflowStatus::Validating));
        assert_eq!(status_for_step("destroy"), None);
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            vec![
                succeeding("planner"),
                succeeding("infrastructure"),
                succeeding("monitoring"),
                succeeding("validation"),
                succeeding("documentation"),
            ],
        );

        let workflow = orch.run("k3s", "development", json!({}), Some("wf-1")).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.outputs.len(), 5);
        assert!(workflow.errors.is_empty());

        let executions = orch.state().list_executions("wf-1").await.unwrap();
        let names: Vec<_> = executions.iter().map(|e| e.agent_name.as_str()).collect();
        assert_eq!(names, ["planner", "infrastructure", "monitoring", "validation", "documentation"]);
        assert!(executions.iter().all(|e| e.status == ExecutionStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_critical_failure_stops_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            vec![succeeding("planner"), failing("infrastructure"), never_run("monitoring")],
        );

        let workflow = orch.run("eks", "production", json!({}), Some("wf-2")).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.errors, vec!["infrastructure: infrastructure broke".to_string()]);
        assert_eq!(orch.state().list_executions("wf-2").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_critical_failure_is_recorded_and_workflow_completes() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            vec![succeeding("planner"), failing("monitoring"), succeeding("documentation")],
        );

        let workflow = orch.run("k3s", "development", json!({}), Some("wf-3")).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.errors, vec!["monitoring: monitoring broke".to_string()]);
        assert!(workflow.outputs.get("monitoring").is_none());
        assert!(workflow.outputs.contains_key("documentation"));
    }

    #[tokio::test]
    async fn test_steps_see_earlier_outputs_and_request_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut second = MockStepRunner::new();
        second.expect_name().return_const("infrastructure");
        second
            .expect_run()
            .withf(|input| {
                input.previous("planner") == Some(&json!({"step": "planner"}))
                    && input.context["platform"] == json!("gke")
                    && input.context["nodes"] == json!(4)
            })
            .returning(|_| {
                Ok(StepOutput {
                    data: json!({}),
                    logs: vec![],
                })
            });
        let orch = orchestrator(&dir, vec![succeeding("planner"), Arc::new(second)]);

        let workflow = orch.run("gke", "staging", json!({"nodes": 4}), Some("wf-4")).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_execute_requires_pending() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, vec![succeeding("planner")]);
        orch.run("k3s", "development", json!({}), Some("wf-5")).await.unwrap();

        let err = orch.execute("wf-5").await.unwrap_err();
        assert!(matches!(err, StateError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_destroy_rolls_back_failed_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, vec![failing("planner")]);
        let workflow = orch.run("k3s", "development", json!({}), Some("wf-6")).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);

        let outcome = orch.destroy("wf-6").await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.workflow.status, WorkflowStatus::RolledBack);
        assert_eq!(outcome.execution.agent_name, DESTROY_AGENT);
    }

    #[tokio::test]
    async fn test_failed_destroy_is_audited_and_status_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut provisioner = MockInfraProvisioner::new();
        provisioner.expect_destroy().returning(|_| {
            Err(crate::external::CommandError::CommandNotFound {
                command: "terraform".to_string(),
            })
        });
        let orch = Orchestrator::new(
            state(&dir),
            vec![failing("planner")],
            Arc::new(provisioner),
            dir.path().join("output"),
        );
        orch.run("k3s", "development", json!({}), Some("wf-7")).await.unwrap();

        let outcome = orch.destroy("wf-7").await.unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.workflow.status, WorkflowStatus::Failed);
        assert_eq!(
            outcome.execution.error_message.as_deref(),
            Some("Command not found: terraform")
        );
    }

    /// File store whose next completion write fails, as a full disk would
    struct FailingCompletion {
        inner: FileBackend,
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl crate::state::StorageBackend for FailingCompletion {
        fn name(&self) -> &'static str {
            "failing-completion"
        }

        async fn migrate(&self) -> Result<(), crate::state::StorageError> {
            self.inner.migrate().await
        }

        async fn put(
            &self,
            table: crate::state::Table,
            key: &str,
            record: crate::state::Record,
        ) -> Result<(), crate::state::StorageError> {
            self.inner.put(table, key, record).await
        }

        async fn insert(
            &self,
            table: crate::state::Table,
            key: &str,
            record: crate::state::Record,
        ) -> Result<(), crate::state::StorageError> {
            self.inner.insert(table, key, record).await
        }

        async fn get(
            &self,
            table: crate::state::Table,
            key: &str,
        ) -> Result<crate::state::Record, crate::state::StorageError> {
            self.inner.get(table, key).await
        }

        async fn list(
            &self,
            table: crate::state::Table,
            filter: &crate::state::Filter,
        ) -> Result<Vec<crate::state::Record>, crate::state::StorageError> {
            self.inner.list(table, filter).await
        }

        async fn update_if(
            &self,
            table: crate::state::Table,
            key: &str,
            expected: &crate::state::Filter,
            partial: crate::state::Record,
        ) -> Result<crate::state::Record, crate::state::StorageError> {
            let completing = table == crate::state::Table::AgentExecutions
                && partial.get("status") == Some(&json!("succeeded"));
            if completing && self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(crate::state::StorageError::Database("disk full".to_string()));
            }
            self.inner.update_if(table, key, expected, partial).await
        }
    }

    #[tokio::test]
    async fn test_state_error_leaves_no_running_execution() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FailingCompletion {
            inner: FileBackend::new(dir.path().join("state.json")),
            armed: std::sync::atomic::AtomicBool::new(true),
        };
        let state = StateManager::new(Arc::new(backend));
        let orch = Orchestrator::new(
            state.clone(),
            vec![succeeding("planner"), never_run("infrastructure")],
            Arc::new(SimulatedProvisioner),
            dir.path().join("output"),
        );

        let err = orch
            .run("k3s", "development", json!({}), Some("wf-8"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));

        assert!(state.running_executions("wf-8").await.unwrap().is_empty());
        let executions = state.list_executions("wf-8").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0]
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("orchestrator: ") && m.contains("disk full")));

        let workflow = state.get_workflow("wf-8").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.errors.len(), 1);
        assert!(workflow.errors[0].starts_with("orchestrator: "));
    }
}
