//! End-to-end CLI tests for the stacks binary.
//!
//! Every test points the binary at a temporary config home so the user's
//! own configuration never leaks in. None of them reach the network.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn stacks(config_home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stacks").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home)
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("stacks.toml");
    std::fs::write(&path, body).unwrap();
    path
}

// ==================== Help and Usage ====================

#[test]
fn test_help_lists_subcommands() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("resolve"))
        .stdout(predicate::str::contains("quota"));
}

#[test]
fn test_version_prints_binary_name() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stacks"));
}

#[test]
fn test_missing_subcommand_is_usage_error() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_backend_is_rejected() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .args(["--backend", "torrent", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("torrent"));
}

// ==================== Config Command ====================

#[test]
fn test_config_masks_secrets() {
    let home = TempDir::new().unwrap();
    let path = write_config(
        &home,
        "[fast_download]\nkey = \"member-secret-key\"\n\n[external]\nsecret = \"rpc-secret\"\n",
    );

    stacks(home.path())
        .arg("-c")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("# config_file = loaded"))
        .stdout(predicate::str::contains("********"))
        .stdout(predicate::str::contains("member-secret-key").not())
        .stdout(predicate::str::contains("rpc-secret").not());
}

#[test]
fn test_config_without_file_uses_defaults() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("not found (using defaults)"))
        .stdout(predicate::str::contains("output_dir = \"download\""));
}

#[test]
fn test_output_dir_flag_overrides_config() {
    let home = TempDir::new().unwrap();
    let path = write_config(&home, "output_dir = \"/srv/books\"\n");

    stacks(home.path())
        .arg("-c")
        .arg(&path)
        .args(["-o", "/tmp/elsewhere", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/tmp/elsewhere"))
        .stdout(predicate::str::contains("/srv/books").not());
}

#[test]
fn test_explicit_missing_config_fails() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .arg("-c")
        .arg(home.path().join("absent.toml"))
        .arg("config")
        .assert()
        .failure();
}

#[test]
fn test_invalid_config_value_fails() {
    let home = TempDir::new().unwrap();
    let path = write_config(&home, "[downloads]\npoll_interval_ms = 1\n");

    stacks(home.path())
        .arg("-c")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("poll_interval_ms"));
}

// ==================== Item Commands ====================

#[test]
fn test_download_rejects_malformed_id() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .args(["-q", "download", "not-an-id"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not-an-id"));
}

#[test]
fn test_download_title_with_several_ids_is_rejected() {
    let home = TempDir::new().unwrap();
    let state = home.path().join("queue.json");
    let path = write_config(
        &home,
        &format!("[queue]\nstate_file = {:?}\n", state.display().to_string()),
    );

    stacks(home.path())
        .arg("-c")
        .arg(&path)
        .args([
            "-q",
            "download",
            "d6e1dc51a50726f00ec438af21952a45",
            "9f86d081884c7d659a2feaa0c55ad015",
            "--title",
            "Dune",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--title"));
    assert!(!state.exists());
}

#[test]
fn test_resolve_rejects_malformed_id() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .args(["-q", "resolve", "xyz"])
        .assert()
        .failure();
}

#[test]
fn test_status_prints_empty_snapshot() {
    let home = TempDir::new().unwrap();
    let state = home.path().join("queue.json");
    let path = write_config(
        &home,
        &format!("[queue]\nstate_file = {:?}\n", state.display().to_string()),
    );

    stacks(home.path())
        .arg("-c")
        .arg(&path)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"queue\": []"))
        .stdout(predicate::str::contains("\"history\": []"));
}

#[test]
fn test_quota_without_key_reports_disabled() {
    let home = TempDir::new().unwrap();
    stacks(home.path())
        .args(["-q", "quota"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"enabled\": false"));
}
