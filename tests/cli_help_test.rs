// CLI behaviour through the real binary, in demo mode against a temporary
// file-backed state store.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn agent(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("terraform-k8s-agent").unwrap();
    cmd.current_dir(dir)
        .env_remove("OPENAI_API_KEY")
        .env_remove("ANTHROPIC_API_KEY")
        .env_remove("RUST_LOG")
        .env("TK8S__APP__DEPLOYMENT_MODE", "demo")
        .env("TK8S__APP__OUTPUT_DIR", dir.join("output"))
        .env("TK8S__STATE__BACKEND", "file")
        .env("TK8S__STATE__FILE_PATH", dir.join("state.json"))
        .env("TK8S__OBSERVABILITY__LOG_LEVEL", "error");
    cmd
}

#[test]
fn test_no_subcommand_shows_guidance() {
    let dir = tempfile::tempdir().unwrap();
    agent(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("terraform-k8s-agent create"))
        .stdout(predicate::str::contains("demo mode"));
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    agent(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("destroy"))
        .stdout(predicate::str::contains("fail-execution"));
}

#[test]
fn test_create_then_status_and_list() {
    let dir = tempfile::tempdir().unwrap();

    agent(dir.path())
        .args(["create", "--platform", "k3s", "--nodes", "2", "--workflow-id", "wf-cli"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deployment complete: wf-cli"));

    agent(dir.path())
        .args(["status", "wf-cli", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"completed\""))
        .stdout(predicate::str::contains("\"agent_name\": \"documentation\""));

    agent(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("wf-cli"));

    agent(dir.path())
        .args(["destroy", "wf-cli"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Infrastructure destroyed"));
}

#[test]
fn test_duplicate_workflow_id_fails() {
    let dir = tempfile::tempdir().unwrap();
    agent(dir.path())
        .args(["create", "--workflow-id", "wf-dup", "--no-monitoring"])
        .assert()
        .success();

    agent(dir.path())
        .args(["create", "--workflow-id", "wf-dup"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_missing_records_exit_with_failure() {
    let dir = tempfile::tempdir().unwrap();
    agent(dir.path())
        .args(["status", "does-not-exist"])
        .assert()
        .failure()
        .code(1);

    agent(dir.path())
        .args(["fail-execution", "no-such-execution", "--reason", "stuck"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_config_prints_effective_settings() {
    let dir = tempfile::tempdir().unwrap();
    agent(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("deployment_mode = \"demo\""))
        .stdout(predicate::str::contains("backend = \"file\""));
}
