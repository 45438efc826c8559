//! End-to-end tests for the `kiln` binary against a temp data directory.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn kiln(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.arg("--data-dir").arg(temp.path());
    cmd
}

/// Run a short training run to completion.
fn train(temp: &TempDir, run_id: &str) {
    kiln(temp)
        .args(["train", "--run-id", run_id, "--epochs", "1", "--steps", "3", "--save-every", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete"));
}

#[test]
fn test_train_runs_to_completion() {
    let temp = TempDir::new().unwrap();
    train(&temp, "smoke");

    kiln(&temp)
        .args(["status", "smoke"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed").and(predicate::str::contains("Best loss")));
}

#[test]
fn test_runs_lists_the_run() {
    let temp = TempDir::new().unwrap();
    train(&temp, "listed");

    kiln(&temp).arg("runs").assert().success().stdout(predicate::str::contains("listed"));
}

#[test]
fn test_metrics_and_logs_read_back() {
    let temp = TempDir::new().unwrap();
    train(&temp, "metrics-run");

    kiln(&temp)
        .args(["metrics", "metrics-run", "--summary", "--eta"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Metrics for metrics-run (3)")
                .and(predicate::str::contains("Summary")),
        );

    kiln(&temp)
        .args(["logs", "metrics-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("training completed"));
}

#[test]
fn test_checkpoints_list_and_delete() {
    let temp = TempDir::new().unwrap();
    train(&temp, "ckpt-run");

    let output = kiln(&temp)
        .args(["checkpoints", "list", "--run", "ckpt-run", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let metas: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let ids: Vec<&str> =
        metas.as_array().unwrap().iter().map(|m| m["id"].as_str().unwrap()).collect();
    assert!(!ids.is_empty());

    kiln(&temp)
        .args(["checkpoints", "delete", ids[0]])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted checkpoint"));

    kiln(&temp)
        .args(["checkpoints", "delete", ids[0]])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_status_unknown_run_fails() {
    let temp = TempDir::new().unwrap();

    kiln(&temp)
        .args(["status", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_delete_removes_run_and_its_checkpoints() {
    let temp = TempDir::new().unwrap();
    train(&temp, "doomed");

    kiln(&temp)
        .args(["delete", "doomed", "--checkpoints"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted run doomed"));

    kiln(&temp).args(["status", "doomed"]).assert().failure();
    kiln(&temp)
        .args(["checkpoints", "list", "--run", "doomed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Checkpoints (0)"));
}

#[test]
fn test_config_file_supplies_train_defaults() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("kiln.toml");
    std::fs::write(&config_path, "[train]\nmodel = \"from-config\"\nepochs = 1\nsteps = 2\n")
        .unwrap();

    kiln(&temp)
        .arg("--config")
        .arg(&config_path)
        .args(["train", "--run-id", "configured"])
        .assert()
        .success()
        .stdout(predicate::str::contains("from-config"));

    kiln(&temp)
        .args(["status", "configured", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"model\": \"from-config\""));
}

#[test]
fn test_json_status_is_parseable() {
    let temp = TempDir::new().unwrap();
    train(&temp, "json-run");

    let output = kiln(&temp).args(["status", "json-run", "--json"]).assert().success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["runId"], "json-run");
    assert_eq!(value["phase"], "completed");
}

#[test]
fn test_data_dir_env_var_is_honored() {
    let temp = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.env("KILN_DATA_DIR", temp.path())
        .args(["train", "--run-id", "env-run", "--epochs", "1", "--steps", "2"])
        .assert()
        .success();

    assert!(temp.path().join("runs").join("env-run").join("run.json").exists());
}
