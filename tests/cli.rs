//! End-to-end CLI smoke tests (assert_cmd), covering the scenarios that
//! don't require a live LLM endpoint: config validation and status reporting
//! against a freshly initialized project directory.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

const SAMPLE_INI: &str = r#"
[server]
endpoints = http://localhost:8080

[security]
deny_tools = delete_file

[paths]
state_dir = state
ipc_dir = ipc

[limits]
stagnation_threshold = 3
context_tokens = 8000
tool_deadline_secs = 120

[logging]
level = info
dir = state/logs

[model_assignments]
planning = gpt-4o@http://localhost:8080
coding = gpt-4o@http://localhost:8080
qa = gpt-4o@http://localhost:8080
debugging = gpt-4o@http://localhost:8080
investigation = gpt-4o@http://localhost:8080
refactoring = gpt-4o@http://localhost:8080
documentation = gpt-4o@http://localhost:8080
"#;

fn init_project(dir: &std::path::Path) {
    fs::write(dir.join("pipeline.ini"), SAMPLE_INI).unwrap();
}

#[test]
fn config_validate_accepts_a_well_formed_ini() {
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    Command::cargo_bin("swe-pipeline")
        .unwrap()
        .args(["--project-dir", dir.path().to_str().unwrap(), "config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
}

#[test]
fn config_validate_reports_a_missing_section() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("pipeline.ini"), "[server]\nendpoints = http://localhost:8080\n").unwrap();

    Command::cargo_bin("swe-pipeline")
        .unwrap()
        .args(["--project-dir", dir.path().to_str().unwrap(), "config", "validate"])
        .assert()
        .code(2);
}

#[test]
fn config_show_prints_resolved_settings() {
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    Command::cargo_bin("swe-pipeline")
        .unwrap()
        .args(["--project-dir", dir.path().to_str().unwrap(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stagnation_threshold: 3"));
}

#[test]
fn status_on_a_fresh_project_reports_zero_tasks() {
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    Command::cargo_bin("swe-pipeline")
        .unwrap()
        .args(["--project-dir", dir.path().to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tasks:     0"));
}

#[test]
fn patterns_list_on_a_fresh_project_prints_nothing_but_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path());

    Command::cargo_bin("swe-pipeline")
        .unwrap()
        .args(["--project-dir", dir.path().to_str().unwrap(), "patterns"])
        .assert()
        .success();
}
