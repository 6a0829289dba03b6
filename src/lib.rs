// Terraform K8s Agent Library - LLM-assisted cluster provisioning
// This exposes the core components for testing and integration

pub mod agents;
pub mod cli;
pub mod config;
pub mod external;
pub mod llm;
pub mod orchestrator;
pub mod state;
pub mod telemetry;

// Re-export key types for easy access
pub use agents::{StepFailure, StepInput, StepOutput, StepResult, StepRunner};
pub use config::{AgentConfig, DeploymentMode};
pub use orchestrator::{DestroyOutcome, Orchestrator, CRITICAL_AGENTS};
pub use state::{
    ExecutionRecord, ExecutionStatus, StateError, StateManager, StorageError, Workflow,
    WorkflowStatus,
};
pub use telemetry::{generate_correlation_id, init_telemetry};
