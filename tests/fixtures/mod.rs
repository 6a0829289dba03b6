//! Shared helpers for integration tests: temporary state stores and
//! scripted step runners.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use terraform_k8s_agent::state::{FileBackend, SqliteBackend, StateManager, StorageBackend};
use terraform_k8s_agent::{StepFailure, StepInput, StepOutput, StepResult, StepRunner};

/// Which backend a test runs against
#[derive(Debug, Clone, Copy)]
pub enum BackendKind {
    Sqlite,
    File,
}

pub const ALL_BACKENDS: [BackendKind; 2] = [BackendKind::Sqlite, BackendKind::File];

/// State manager over a fresh store inside `dir`
pub async fn open_state(dir: &Path, kind: BackendKind) -> StateManager {
    match kind {
        BackendKind::Sqlite => {
            let backend = SqliteBackend::connect(&dir.join("state.db"), 5)
                .await
                .expect("Failed to open sqlite backend");
            backend.migrate().await.expect("Failed to migrate sqlite backend");
            StateManager::new(Arc::new(backend))
        }
        BackendKind::File => StateManager::new(Arc::new(FileBackend::new(dir.join("state.json")))),
    }
}

pub async fn temp_state(kind: BackendKind) -> (TempDir, StateManager) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let state = open_state(dir.path(), kind).await;
    (dir, state)
}

/// A request config with nested structure, for round-trip checks
pub fn sample_config() -> Value {
    json!({
        "nodes": 3,
        "region": "us-east-1",
        "monitoring": {"enabled": true, "retention": "7d", "alerting": false},
        "addons": ["ingress-nginx", "cert-manager"],
        "resources": {"cpu": 2.5, "memory_gb": null},
    })
}

/// Step runner that returns a scripted result and counts its calls
pub struct ScriptedStep {
    name: &'static str,
    fail_with: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedStep {
    pub fn ok(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_with: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &'static str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_with: Some(message.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepRunner for ScriptedStep {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, input: &StepInput) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(message) => Err(StepFailure::new(message.clone(), vec![format!("{} failed", self.name)])),
            None => Ok(StepOutput {
                data: json!({
                    "summary": format!("{} done", self.name),
                    "saw_steps": input.previous_outputs.keys().cloned().collect::<Vec<_>>(),
                }),
                logs: vec![format!("{} ran", self.name)],
            }),
        }
    }
}

/// The five standard step names, all succeeding
pub fn standard_steps() -> Vec<Arc<ScriptedStep>> {
    ["planner", "infrastructure", "monitoring", "validation", "documentation"]
        .into_iter()
        .map(ScriptedStep::ok)
        .collect()
}

pub fn as_runners(steps: &[Arc<ScriptedStep>]) -> Vec<Arc<dyn StepRunner>> {
    steps
        .iter()
        .map(|step| step.clone() as Arc<dyn StepRunner>)
        .collect()
}
