//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Metric anomaly fusion and alert delivery",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("driftwatch"));
}

#[test]
fn test_scan_subcommand_exists() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["scan", "--help"])
        .assert()
        .success();
}

#[test]
fn test_rules_validate_subcommand_exists() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["rules", "validate", "--help"])
        .assert()
        .success();
}

#[test]
fn test_deadletter_list_subcommand_exists() {
    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["deadletter", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_anomalies_list_runs_against_fresh_db() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("smoke.db");

    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["--db", db.to_str().unwrap(), "anomalies", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No anomalies found."));
}

#[test]
fn test_ingest_then_scan_reports_series() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("smoke.db");
    let input = dir.path().join("points.jsonl");

    let mut lines = String::new();
    for i in 1..=12 {
        lines.push_str(&format!(
            "{{\"entity\":\"page:/\",\"metric\":\"load.score\",\"day\":\"2026-07-{i:02}\",\"value\":{}}}\n",
            90.0 + (i % 3) as f64
        ));
    }
    std::fs::write(&input, lines).unwrap();

    Command::cargo_bin("driftwatch")
        .unwrap()
        .args([
            "--db",
            db.to_str().unwrap(),
            "ingest",
            "--file",
            input.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("Ingested 12 metric points"));

    Command::cargo_bin("driftwatch")
        .unwrap()
        .args(["--db", db.to_str().unwrap(), "scan"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Series scanned:      1"));
}
