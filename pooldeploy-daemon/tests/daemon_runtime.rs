#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pooldeploy_core::{ApplicationSpec, Config, OperationStatus, Settings};
use pooldeploy_daemon::paths::socket_path;
use pooldeploy_daemon::{
    request_status, request_stop, request_trigger, run_with, MemoryAuditSink,
    MemoryPoolController, PoolCall,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;

async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}

async fn status(home: &Path) -> Option<Value> {
    let home = home.to_path_buf();
    tokio::task::spawn_blocking(move || request_status(&home).ok())
        .await
        .unwrap()
}

async fn wait_for_status<F>(home: &Path, timeout: Duration, mut accept: F) -> Option<Value>
where
    F: FnMut(&Value) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = status(home).await {
            if accept(&status) {
                return Some(status);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

fn config_for(src: &Path, dst: &Path) -> Config {
    Config {
        settings: Settings {
            flush_interval_ms: 1_000,
            cooldown_secs: 0,
            retry_delay_ms: 0,
            ..Settings::default()
        },
        applications: vec![ApplicationSpec::new("API", "ApiPool")
            .with_watch_root(src)
            .with_copy(src, dst)],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_change_is_deployed_and_control_socket_answers() {
    let home = TempDir::new().unwrap();
    let src: PathBuf = home.path().join("src");
    let dst: PathBuf = home.path().join("dst");
    fs::create_dir_all(&src).unwrap();
    fs::create_dir_all(&dst).unwrap();

    let pools = Arc::new(MemoryPoolController::with_pools(["ApiPool"]));
    let audit = Arc::new(MemoryAuditSink::default());
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let daemon = tokio::spawn(run_with(
        home.path().to_path_buf(),
        config_for(&src, &dst),
        home.path().join("config.yaml"),
        pools.clone(),
        audit.clone(),
        true,
        shutdown_tx.clone(),
    ));

    let first = wait_for_status(home.path(), Duration::from_secs(10), |_| true)
        .await
        .expect("daemon should answer status");
    assert_eq!(first["running"], Value::Bool(true));
    assert_eq!(first["simulate"], Value::Bool(true));
    assert_eq!(first["applications"][0]["name"], "API");

    // Give the watcher a moment to register its roots.
    tokio::time::sleep(Duration::from_millis(200)).await;
    fs::write(src.join("app.dll"), b"build-1").unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || !audit.operations().is_empty()).await,
        "a deployment should be audited after the flush"
    );
    let operation = &audit.operations()[0];
    assert_eq!(operation.status, OperationStatus::Completed);
    assert_eq!(fs::read(dst.join("app.dll")).unwrap(), b"build-1");
    assert_eq!(
        &pools.calls()[..2],
        &[
            PoolCall::Stop("ApiPool".into()),
            PoolCall::Start("ApiPool".into())
        ]
    );

    // Late watcher events may still be flushing; wait for a quiet daemon.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    wait_for_status(home.path(), Duration::from_secs(10), |s| {
        s["active_operations"] == 0 && s["pending_changes"] == 0
    })
    .await
    .expect("daemon should go idle");

    let trigger = {
        let home = home.path().to_path_buf();
        tokio::task::spawn_blocking(move || request_trigger(&home, "api", Some(5)))
            .await
            .unwrap()
            .expect("trigger response")
    };
    assert_eq!(trigger["admitted"], Value::Bool(true));
    assert_eq!(trigger["operation"]["status"], "completed");

    let unknown = {
        let home = home.path().to_path_buf();
        tokio::task::spawn_blocking(move || request_trigger(&home, "Nope", None))
            .await
            .unwrap()
    };
    assert!(unknown.is_err(), "unknown application should be rejected");

    {
        let home = home.path().to_path_buf();
        tokio::task::spawn_blocking(move || request_stop(&home))
            .await
            .unwrap()
            .expect("stop request");
    }
    let result = tokio::time::timeout(Duration::from_secs(15), daemon)
        .await
        .expect("daemon should exit")
        .unwrap();
    assert!(result.is_ok(), "daemon exited with {result:?}");
    assert!(!socket_path(home.path()).exists());
}
