//! Integration tests for the ptq-mlp CLI.

use assert_cmd::Command;
use std::fs;
use tempfile::TempDir;

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("ptq-mlp").expect("Failed to find ptq-mlp binary");
    cmd.args(args);
    cmd
}

#[test]
fn test_help() {
    let output = run_cli(&["--help"]).output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["init", "validate", "run"] {
        assert!(stdout.contains(command), "help should list '{command}'");
    }
}

#[test]
fn test_init_then_validate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ptq.yaml");
    let path_str = path.to_str().unwrap();

    run_cli(&["init", path_str, "--preset", "qnnpack"])
        .assert()
        .success();
    assert!(path.exists());

    let output = run_cli(&["validate", path_str]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration is valid"));
}

#[test]
fn test_init_unknown_preset() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ptq.yaml");

    run_cli(&["init", path.to_str().unwrap(), "--preset", "tensorrt"])
        .assert()
        .failure();
    assert!(!path.exists());
}

#[test]
fn test_validate_rejects_invalid() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.yaml");
    fs::write(&path, "model:\n  seq_depth: 0\n").unwrap();

    run_cli(&["validate", path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_run_defaults() {
    let output = run_cli(&["run", "--batch-size", "4", "--calibration-batches", "2"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Output shape: [4, 16]"));
    assert!(stdout.contains("Compression ratio"));
}

#[test]
fn test_run_saves_and_loads_weights() {
    let dir = TempDir::new().unwrap();
    let weights = dir.path().join("model.safetensors");
    let weights_str = weights.to_str().unwrap();

    run_cli(&["run", "--save-weights", weights_str, "--calibration-batches", "1"])
        .assert()
        .success();
    assert!(weights.exists());

    run_cli(&["run", "--weights", weights_str, "--calibration-batches", "1"])
        .assert()
        .success();
}

#[test]
fn test_run_rejects_zero_batches() {
    run_cli(&["run", "--calibration-batches", "0"])
        .assert()
        .failure();
}
