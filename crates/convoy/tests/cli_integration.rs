//! CLI integration tests for the Convoy command-line interface.
//!
//! These tests need no pub/sub broker: they cover argument parsing, help
//! output, and the config commands against a temporary config directory.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A convoy command isolated from the user's real config and working dir.
fn convoy(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("convoy").unwrap();
    cmd.env("CONVOY_CONFIG_DIR", dir.path())
        .env_remove("CONVOY_REDIS_URL")
        .env_remove("RUST_LOG")
        .current_dir(dir.path());
    cmd
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    convoy(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fleet coordination"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("publish"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_displays() {
    let dir = TempDir::new().unwrap();
    convoy(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("convoy"));
}

#[test]
fn test_start_help_shows_overrides() {
    let dir = TempDir::new().unwrap();
    convoy(&dir)
        .args(["start", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--type"))
        .stdout(predicate::str::contains("--multi-main"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument Validation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_unknown_instance_type_rejected() {
    let dir = TempDir::new().unwrap();
    convoy(&dir)
        .args(["start", "--type", "scheduler"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown instance type"));
}

#[test]
fn test_unknown_command_rejected() {
    let dir = TempDir::new().unwrap();
    convoy(&dir)
        .args(["publish", "reboot-everything"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown command"));
}

#[test]
fn test_publish_requires_scaling() {
    let dir = TempDir::new().unwrap();
    convoy(&dir)
        .args(["publish", "reload-license"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("scaling is disabled"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_defaults() {
    let dir = TempDir::new().unwrap();
    convoy(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No config files loaded"))
        .stdout(predicate::str::contains("debounce_ms = 300"))
        .stdout(predicate::str::contains("offer_validity_ms = 5000"));
}

#[test]
fn test_config_show_json() {
    let dir = TempDir::new().unwrap();
    let output = convoy(&dir)
        .args(["--json", "config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["scaling"]["enabled"], false);
    assert_eq!(value["instance"]["type"], "main");
}

#[test]
fn test_project_file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("convoy.toml"),
        "[instance]\ntype = \"worker\"\n\n[scaling]\ndebounce_ms = 50\n",
    )
    .unwrap();

    convoy(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("type = \"worker\""))
        .stdout(predicate::str::contains("debounce_ms = 50"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("convoy.toml"), "[scaling]\ndebounce_ms = 0\n").unwrap();

    convoy(&dir)
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("debounce_ms"));
}

#[test]
fn test_config_init_then_which() {
    let dir = TempDir::new().unwrap();
    convoy(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    assert!(dir.path().join("config.toml").is_file());

    convoy(&dir)
        .args(["config", "which"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[loaded]"))
        .stdout(predicate::str::contains("config.toml"));

    // A second init refuses to overwrite
    convoy(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}
