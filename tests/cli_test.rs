use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

const REVIEW_FLOW: &str = r#"
nodes:
  - id: draft
    kind: agent
    config:
      agent_id: writer
      prompt: first draft
  - id: polish
    kind: agent
    config: { agent_id: editor }
  - id: approve
    kind: human
    config:
      instructions: Approve the draft
edges:
  - { from: draft, to: polish }
  - { from: draft, to: approve }
"#;

const CYCLIC_FLOW: &str = r#"
nodes:
  - { id: a, kind: agent, config: { agent_id: w } }
  - { id: b, kind: agent, config: { agent_id: w } }
edges:
  - { from: a, to: b }
  - { from: b, to: a }
"#;

fn write_graph(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn dagrun(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dagrun").unwrap();
    cmd.arg("--db").arg(dir.path().join("state.db"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn stdout_json(output: std::process::Output) -> serde_json::Value {
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_validate_accepts_dag() {
    let dir = TempDir::new().unwrap();
    let graph = write_graph(&dir, "review.yml", REVIEW_FLOW);

    dagrun(&dir)
        .arg("validate")
        .arg(&graph)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\": true"));
}

#[test]
fn test_validate_rejects_cycle() {
    let dir = TempDir::new().unwrap();
    let graph = write_graph(&dir, "cyclic.yml", CYCLIC_FLOW);

    dagrun(&dir)
        .arg("validate")
        .arg(&graph)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_run_then_resume_across_processes() {
    let dir = TempDir::new().unwrap();
    let graph = write_graph(&dir, "review.yml", REVIEW_FLOW);

    let run = stdout_json(dagrun(&dir).arg("run").arg(&graph).output().unwrap());
    let task_id = run["task_id"].as_str().unwrap().to_string();
    assert_eq!(run["workflow_id"], "review");
    assert_eq!(run["status"], "running");

    let nodes = run["nodes"].as_array().unwrap();
    let approve = nodes.iter().find(|n| n["id"] == "approve").unwrap();
    assert_eq!(approve["status"], "awaiting_input");

    let resumed = stdout_json(
        dagrun(&dir)
            .args(["--actor", "reviewer", "resume", &task_id, "approve", "looks good"])
            .output()
            .unwrap(),
    );
    assert_eq!(resumed["resume"]["outcome"], "completed");
    assert_eq!(resumed["task"]["status"], "completed");

    let results = stdout_json(dagrun(&dir).args(["results", &task_id]).output().unwrap());
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["node_id"], "draft");
    assert_eq!(results[0]["output"], "first draft");
    assert!(results.iter().any(|r| r["node_id"] == "approve" && r["output"] == "looks good"));
}

#[test]
fn test_cancel_parked_task() {
    let dir = TempDir::new().unwrap();
    let graph = write_graph(&dir, "review.yml", REVIEW_FLOW);

    let run = stdout_json(dagrun(&dir).arg("run").arg(&graph).output().unwrap());
    let task_id = run["task_id"].as_str().unwrap().to_string();

    let cancelled = stdout_json(dagrun(&dir).args(["cancel", &task_id]).output().unwrap());
    assert_eq!(cancelled["status"], "cancelled");

    dagrun(&dir)
        .args(["resume", &task_id, "approve", "too late"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not_awaiting_input"));
}

#[test]
fn test_status_of_unknown_task_fails() {
    let dir = TempDir::new().unwrap();
    dagrun(&dir)
        .args(["status", "does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
