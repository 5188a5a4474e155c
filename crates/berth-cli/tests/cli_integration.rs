//! CLI subprocess integration tests.
//!
//! These tests invoke the `berth` binary as a subprocess against the mock
//! runtime and verify exit codes, stdout content, and JSON output.

use std::path::{Path, PathBuf};
use std::process::Command;

fn berth_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_berth"));
    cmd.env("BERTH_SKIP_PREREQS", "1");
    cmd.env_remove("BERTH_LOG");
    cmd
}

fn write_manifest(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("berth.toml");
    std::fs::write(&path, content).unwrap();
    path
}

fn write_three_tier(dir: &Path) -> PathBuf {
    write_manifest(
        dir,
        r#"manifest_version = 1

[environment]
name = "shop"
type = "docker"

[machines.db]
image = "postgres:16"

[machines.cache]
image = "redis:7"

[machines.api]
image = "shop-api:dev"
links = ["db:database", "cache"]

[machines.web]
image = "shop-web:dev"
links = ["api"]
"#,
    )
}

fn empty_config(dir: &Path) -> PathBuf {
    let path = dir.join("engine.toml");
    std::fs::write(&path, "").unwrap();
    path
}

#[test]
fn cli_version_exits_zero() {
    let output = berth_bin().arg("--version").output().unwrap();
    assert!(output.status.success(), "berth --version must exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("berth"), "version output: {stdout}");
}

#[test]
fn cli_help_lists_commands() {
    let output = berth_bin().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["validate", "plan", "build", "up", "down", "ps", "completions"] {
        assert!(stdout.contains(cmd), "help must list '{cmd}': {stdout}");
    }
}

#[test]
fn cli_unknown_subcommand_fails() {
    let output = berth_bin().arg("launch").output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn cli_validate_accepts_good_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let output = berth_bin()
        .args(["validate", &manifest.to_string_lossy()])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("shop"));
    assert!(stdout.contains("4 machine(s)"));
}

#[test]
fn cli_validate_json() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let output = berth_bin()
        .args(["--json", "validate", &manifest.to_string_lossy()])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["valid"], true);
    assert_eq!(json["type"], "docker");
    assert_eq!(json["machines"].as_array().unwrap().len(), 4);
}

#[test]
fn cli_validate_missing_manifest_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let output = berth_bin()
        .args(["validate", &dir.path().join("nope.toml").to_string_lossy()])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("manifest error"), "stderr: {stderr}");
}

#[test]
fn cli_validate_unknown_link_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(
        dir.path(),
        r#"manifest_version = 1

[machines.app]
image = "app:1"
links = ["db"]
"#,
    );
    let output = berth_bin()
        .args(["validate", &manifest.to_string_lossy()])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown machine 'db'"), "stderr: {stderr}");
}

#[test]
fn cli_validate_cycle_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(
        dir.path(),
        r#"manifest_version = 1

[machines.a]
image = "a:1"
links = ["b"]

[machines.b]
image = "b:1"
links = ["a"]
"#,
    );
    let output = berth_bin()
        .args(["validate", &manifest.to_string_lossy()])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cycle"), "stderr: {stderr}");
}

#[test]
fn cli_plan_json_levels() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let output = berth_bin()
        .args(["--json", "plan", &manifest.to_string_lossy()])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let levels = json["levels"].as_array().unwrap();
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[0], serde_json::json!(["cache", "db"]));
    assert_eq!(levels[1], serde_json::json!(["api"]));
    assert_eq!(levels[2], serde_json::json!(["web"]));
}

#[test]
fn cli_plan_text_shows_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let output = berth_bin()
        .args(["plan", &manifest.to_string_lossy()])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("api (after cache, db)"), "stdout: {stdout}");
    assert!(stdout.contains("web (after api)"), "stdout: {stdout}");
}

#[test]
fn cli_up_detached_with_mock_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let config = empty_config(dir.path());
    let output = berth_bin()
        .args([
            "--json",
            "--config",
            &config.to_string_lossy(),
            "up",
            &manifest.to_string_lossy(),
            "--runtime",
            "mock",
            "--workspace",
            "ws1",
            "--detach",
        ])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let machines = json.as_array().unwrap();
    assert_eq!(machines.len(), 4);
    let names: Vec<&str> = machines
        .iter()
        .map(|m| m["display_name"].as_str().unwrap())
        .collect();
    let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
    assert!(pos("db") < pos("api"));
    assert!(pos("cache") < pos("api"));
    assert!(pos("api") < pos("web"));
    for m in machines {
        assert_eq!(m["status"], "running");
        assert_eq!(m["workspace_id"], "ws1");
    }
}

#[test]
fn cli_up_rejects_unknown_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let config = empty_config(dir.path());
    let output = berth_bin()
        .args([
            "--config",
            &config.to_string_lossy(),
            "up",
            &manifest.to_string_lossy(),
            "--runtime",
            "lxc",
            "--detach",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn cli_up_rejects_zero_parallelism() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let config = empty_config(dir.path());
    let output = berth_bin()
        .args([
            "--config",
            &config.to_string_lossy(),
            "up",
            &manifest.to_string_lossy(),
            "--runtime",
            "mock",
            "--parallelism",
            "0",
            "--detach",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("max_parallelism"), "stderr: {stderr}");
}

#[test]
fn cli_invalid_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let config = dir.path().join("engine.toml");
    std::fs::write(&config, "max_paralelism = 2\n").unwrap();
    let output = berth_bin()
        .args([
            "--config",
            &config.to_string_lossy(),
            "down",
            &manifest.to_string_lossy(),
            "--runtime",
            "mock",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("config error"), "stderr: {stderr}");
}

#[test]
fn cli_down_with_nothing_running_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let config = empty_config(dir.path());
    let output = berth_bin()
        .args([
            "--json",
            "--config",
            &config.to_string_lossy(),
            "down",
            &manifest.to_string_lossy(),
            "--runtime",
            "mock",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["stopped"], 0);
    assert_eq!(json["workspace"], "default");
}

#[test]
fn cli_ps_empty_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let config = empty_config(dir.path());
    let output = berth_bin()
        .args([
            "--json",
            "--config",
            &config.to_string_lossy(),
            "ps",
            "--runtime",
            "mock",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(json.as_array().unwrap().is_empty());
}

#[test]
fn cli_build_with_only_images_builds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_three_tier(dir.path());
    let config = empty_config(dir.path());
    let output = berth_bin()
        .args([
            "--json",
            "--config",
            &config.to_string_lossy(),
            "build",
            &manifest.to_string_lossy(),
            "--runtime",
            "mock",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(json.as_array().unwrap().is_empty());
}

#[test]
fn cli_build_with_mock_runtime_tags_image() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM alpine:3\n").unwrap();
    let manifest = write_manifest(
        dir.path(),
        r#"manifest_version = 1

[machines.app.build]
files = ["Dockerfile"]
"#,
    );
    let config = empty_config(dir.path());
    let output = berth_bin()
        .args([
            "--json",
            "--config",
            &config.to_string_lossy(),
            "build",
            &manifest.to_string_lossy(),
            "--runtime",
            "mock",
            "--workspace",
            "ws9",
        ])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let built = json.as_array().unwrap();
    assert_eq!(built.len(), 1);
    assert_eq!(built[0]["machine"], "app");
    assert!(!built[0]["image"].as_str().unwrap().is_empty());
}

#[test]
fn cli_completions_bash() {
    let output = berth_bin().args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("berth"), "completions must mention the binary");
}
