use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;

use pooldeploy_core::{ApplicationSpec, Config, DeploymentOperation, OperationStatus, Settings};
use pooldeploy_daemon::paths::audit_log_path;
use tempfile::TempDir;

fn pooldeploy_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("pooldeploy"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("POOLDEPLOY_CONFIG");
    cmd
}

fn sample_config(home: &Path) -> Config {
    let src = home.join("src").join("api");
    Config {
        settings: Settings::default(),
        applications: vec![
            ApplicationSpec::new("API", "ApiPool")
                .with_watch_root(&src)
                .with_copy(&src, home.join("srv").join("api")),
            ApplicationSpec::new("Web", "WebPool").with_watch_root(home.join("src").join("web")),
        ],
    }
}

#[test]
fn validate_accepts_saved_config() {
    let home = TempDir::new().expect("home");
    sample_config(home.path()).save_at(home.path()).expect("save config");

    pooldeploy_cmd(home.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(contains("valid:"))
        .stdout(contains("2 application(s), 2 enabled"));
}

#[test]
fn validate_reports_every_problem() {
    let home = TempDir::new().expect("home");
    let path = home.path().join("broken.yaml");
    fs::write(
        &path,
        "settings:\n  flush_interval_ms: 10\napplications:\n  - name: API\n    pool_name: \"\"\n    watch_roots: [relative/dir]\n    source_root: /src/api\n",
    )
    .expect("write config");

    pooldeploy_cmd(home.path())
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(contains("flush_interval_ms"))
        .stderr(contains("pool_name must not be empty"))
        .stderr(contains("must be absolute"))
        .stderr(contains("destination_root is required"));
}

#[test]
fn missing_config_is_an_error() {
    let home = TempDir::new().expect("home");
    pooldeploy_cmd(home.path())
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(contains("config not found"));
}

#[test]
fn config_path_honours_env_override() {
    let home = TempDir::new().expect("home");
    let custom = home.path().join("custom.yaml");

    pooldeploy_cmd(home.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(contains(".pooldeploy"));

    pooldeploy_cmd(home.path())
        .env("POOLDEPLOY_CONFIG", &custom)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(contains("custom.yaml"));
}

#[test]
fn apps_json_includes_last_audited_deployment() {
    let home = TempDir::new().expect("home");
    let config = sample_config(home.path());
    config.save_at(home.path()).expect("save config");

    let mut op = DeploymentOperation::new(&config.applications[0], vec![]);
    op.finish(OperationStatus::Completed);
    let audit = audit_log_path(home.path());
    fs::create_dir_all(audit.parent().expect("audit dir")).expect("mkdir audit");
    fs::write(
        &audit,
        format!("{}\n", serde_json::to_string(&op).expect("serialize")),
    )
    .expect("write audit");

    let output = pooldeploy_cmd(home.path())
        .args(["apps", "--json"])
        .output()
        .expect("run apps");
    assert!(
        output.status.success(),
        "apps failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let apps: serde_json::Value = serde_json::from_slice(&output.stdout).expect("apps JSON");
    assert_eq!(apps.as_array().map(Vec::len), Some(2));
    assert_eq!(apps[0]["name"], "API");
    assert_eq!(apps[0]["copy_enabled"], true);
    assert_eq!(apps[0]["last_status"], "completed");
    assert_eq!(apps[1]["name"], "Web");
    assert!(apps[1]["last_status"].is_null());
}

#[test]
fn apps_table_lists_pools() {
    let home = TempDir::new().expect("home");
    sample_config(home.path()).save_at(home.path()).expect("save config");

    pooldeploy_cmd(home.path())
        .arg("apps")
        .assert()
        .success()
        .stdout(contains("ApiPool"))
        .stdout(contains("WebPool"))
        .stdout(contains("never"));
}

#[test]
fn control_commands_without_daemon() {
    let home = TempDir::new().expect("home");

    pooldeploy_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));

    pooldeploy_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));

    pooldeploy_cmd(home.path())
        .args(["trigger", "API"])
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));
}
