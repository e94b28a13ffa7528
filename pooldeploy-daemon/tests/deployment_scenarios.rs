use std::sync::Arc;
use std::time::Duration;

use pooldeploy_core::{
    ApplicationName, ApplicationSpec, ChangeKind, Config, ExcludeSet, OperationStatus, Settings,
    StepKind, StepStatus,
};
use pooldeploy_daemon::{
    Admission, ChangeNormalizer, DeploymentCoordinator, FlushScheduler, MemoryAuditSink,
    MemoryPoolController, PendingChangeSet, PoolCall, RawEvent, StepExecutor,
};
use pooldeploy_sync::RetryingTransfer;
use tokio::sync::{broadcast, mpsc};
use tokio::time::advance;

struct Harness {
    coordinator: Arc<DeploymentCoordinator>,
    pools: Arc<MemoryPoolController>,
    audit: Arc<MemoryAuditSink>,
}

fn harness(applications: Vec<ApplicationSpec>, settings: Settings) -> Harness {
    let pools = Arc::new(MemoryPoolController::with_pools(
        applications.iter().map(|app| app.pool_name.clone()),
    ));
    let audit = Arc::new(MemoryAuditSink::default());
    let executor = StepExecutor::new(pools.clone(), Arc::new(RetryingTransfer), &settings);
    let config = Config {
        settings,
        applications,
    };
    let coordinator = Arc::new(DeploymentCoordinator::new(&config, executor, audit.clone()));
    Harness {
        coordinator,
        pools,
        audit,
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_touches_within_one_interval_deploy_once() {
    let settings = Settings {
        flush_interval_ms: 5_000,
        ..Settings::default()
    };
    let app = ApplicationSpec::new("App1", "Pool1")
        .with_watch_root("/src/app1")
        .with_exclude("*.tmp");
    let h = harness(vec![app], settings.clone());

    let normalizer = ChangeNormalizer::new(ExcludeSet::new(["*.tmp"]));
    let pending = Arc::new(PendingChangeSet::default());
    let scheduler = FlushScheduler::new(pending.clone(), settings.flush_interval());
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let flush = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move {
            scheduler
                .run(
                    |batch| {
                        let coordinator = coordinator.clone();
                        let results_tx = results_tx.clone();
                        async move {
                            let _ = results_tx.send(coordinator.dispatch(batch).await);
                        }
                    },
                    shutdown_rx,
                )
                .await;
        })
    };

    for kind in [ChangeKind::Created, ChangeKind::Modified, ChangeKind::Modified] {
        assert!(normalizer.ingest(RawEvent::new("/src/app1/a.txt", kind), &pending));
        advance(Duration::from_millis(600)).await;
    }
    assert!(!normalizer.ingest(
        RawEvent::new("/src/app1/a.tmp", ChangeKind::Modified),
        &pending
    ));

    advance(Duration::from_millis(5_000)).await;
    let results = results_rx.recv().await.expect("one flushed batch");
    assert_eq!(results.len(), 1);
    let (name, admission) = &results[0];
    assert_eq!(name, &ApplicationName::from("App1"));
    let op = admission.operation().expect("admitted");
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.changes.len(), 1);
    assert_eq!(op.changes[0].kind, ChangeKind::Modified);

    let _ = shutdown_tx.send(());
    flush.await.unwrap();
    assert!(results_rx.try_recv().is_err(), "no second trigger");
    assert_eq!(h.audit.operations().len(), 1);
    assert_eq!(
        h.pools.calls(),
        vec![PoolCall::Stop("Pool1".into()), PoolCall::Start("Pool1".into())]
    );
}

#[tokio::test]
async fn copy_disabled_runs_stop_skip_start() {
    let app = ApplicationSpec::new("API", "ApiPool").with_watch_root("/src/api");
    let h = harness(vec![app], Settings::default());

    let admission = h
        .coordinator
        .trigger_manual("API", None)
        .await
        .expect("trigger");
    let op = match admission {
        Admission::Completed(op) => op,
        other => panic!("expected a deployment, got {other:?}"),
    };

    let steps: Vec<(StepKind, StepStatus)> = op.steps.iter().map(|s| (s.kind, s.status)).collect();
    assert_eq!(
        steps,
        vec![
            (StepKind::StopPool, StepStatus::Completed),
            (StepKind::CopyFiles, StepStatus::Skipped),
            (StepKind::StartPool, StepStatus::Completed),
        ]
    );
    assert_eq!(op.status, OperationStatus::Completed);
}

#[tokio::test]
async fn failed_stop_leaves_a_single_step_and_is_audited() {
    let app = ApplicationSpec::new("API", "ApiPool").with_watch_root("/src/api");
    let h = harness(vec![app], Settings::default());
    h.pools.fail_stop("ApiPool");

    let admission = h
        .coordinator
        .deploy(&ApplicationName::from("API"), vec![])
        .await
        .unwrap();
    let op = admission.operation().expect("admitted");
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.steps.len(), 1);
    assert_eq!(op.steps[0].kind, StepKind::StopPool);
    assert_eq!(op.steps[0].status, StepStatus::Failed);

    let audited = h.audit.operations();
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0].id, op.id);
}

#[tokio::test]
async fn detached_dispatch_counts_until_finished() {
    let app = ApplicationSpec::new("API", "ApiPool").with_watch_root("/src/api");
    let h = harness(vec![app], Settings::default());

    let batch = vec![pooldeploy_core::ChangeRecord::new(
        "/src/api/a.dll",
        ChangeKind::Modified,
    )];
    let handle = h.coordinator.dispatch_detached(batch);
    assert!(
        h.coordinator
            .wait_for_idle(Duration::from_secs(5), Duration::from_millis(10))
            .await
    );
    assert_eq!(h.audit.operations().len(), 1);
    assert_eq!(handle.await.unwrap().len(), 1);
}
