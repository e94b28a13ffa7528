use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, RecommendedWatcher, RecursiveMode, Watcher};
use pooldeploy_core::{ApplicationSpec, Config};
use pooldeploy_sync::RetryingTransfer;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

use crate::audit::{AuditSink, FanoutAuditSink, JsonlAuditSink, TracingAuditSink};
use crate::coordinator::{Admission, DeploymentCoordinator};
use crate::error::{io_err, DaemonError};
use crate::executor::StepExecutor;
use crate::health;
use crate::normalizer::{ChangeNormalizer, RawEvent};
use crate::paths::{audit_dir, audit_log_path, daemon_log_path, logs_dir, socket_path};
use crate::pending::{FlushScheduler, PendingChangeSet};
use crate::pool::{CommandPoolController, MemoryPoolController, PoolController};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::router::is_under_root;

/// Poll period while waiting for running deployments at shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// Grace period for the audit writer once the coordinator is gone.
const AUDIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// How `pooldeploy daemon start` wants the daemon run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub home: PathBuf,
    /// Overrides `<home>/.pooldeploy/config.yaml`.
    pub config_path: Option<PathBuf>,
    /// Drive pools in memory instead of through the configured commands.
    pub simulate: bool,
    /// Write logs to `daemon.log` instead of stderr.
    pub log_to_file: bool,
}

/// Everything the daemon's tasks share.
struct Shared {
    home: PathBuf,
    config: Config,
    config_path: PathBuf,
    coordinator: Arc<DeploymentCoordinator>,
    pending: Arc<PendingChangeSet>,
    simulate: bool,
    started_at_unix: u64,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(options: RunOptions) -> Result<(), DaemonError> {
    if options.log_to_file {
        ensure_dir(&logs_dir(&options.home))?;
        init_tracing(Some(daemon_log_path(&options.home)));
    } else {
        init_tracing(None);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    let result = runtime.block_on(run(options));
    // Abandoned transfers may still sit on blocking threads.
    runtime.shutdown_timeout(Duration::from_secs(10));
    result
}

/// Load configuration, build the production collaborators and run until a
/// stop request or ctrl-c.
pub async fn run(options: RunOptions) -> Result<(), DaemonError> {
    let config_path = match &options.config_path {
        Some(path) => path.clone(),
        None => pooldeploy_core::config::config_path_at(&options.home),
    };
    let config = Config::load_from(&config_path)?;

    let pools: Arc<dyn PoolController> = if options.simulate {
        tracing::info!("simulation mode: pools are driven in memory");
        Arc::new(MemoryPoolController::with_pools(
            config.applications.iter().map(|app| app.pool_name.clone()),
        ))
    } else {
        Arc::new(CommandPoolController::new(config.settings.pool.clone()))
    };

    let (audit_writer, audit_task) = JsonlAuditSink::spawn(audit_log_path(&options.home));
    let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(vec![
        Arc::new(TracingAuditSink),
        Arc::new(audit_writer),
    ]));

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let result = run_with(
        options.home,
        config,
        config_path,
        pools,
        audit,
        options.simulate,
        shutdown_tx,
    )
    .await;

    // Every sink clone is gone once `run_with` returns, unless an abandoned
    // deployment still holds one.
    if tokio::time::timeout(AUDIT_FLUSH_TIMEOUT, audit_task)
        .await
        .is_err()
    {
        tracing::warn!("audit writer still busy at exit; some operations may be missing");
    }
    result
}

/// Run the daemon with explicit collaborators until `shutdown` fires.
pub async fn run_with(
    home: PathBuf,
    config: Config,
    config_path: PathBuf,
    pools: Arc<dyn PoolController>,
    audit: Arc<dyn AuditSink>,
    simulate: bool,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let settings = config.settings.clone();
    let executor = StepExecutor::new(pools, Arc::new(RetryingTransfer), &settings);
    let coordinator = Arc::new(DeploymentCoordinator::new(&config, executor, audit));
    let pending = Arc::new(PendingChangeSet::default());
    let scheduler = FlushScheduler::new(pending.clone(), settings.flush_interval());
    let normalizer = ChangeNormalizer::new(pooldeploy_core::ExcludeSet::new(
        &settings.exclude_patterns,
    ));

    let shared = Arc::new(Shared {
        home,
        config,
        config_path,
        coordinator: coordinator.clone(),
        pending: pending.clone(),
        simulate,
        started_at_unix: unix_seconds_now(),
    });
    let mut stop_rx = shutdown_tx.subscribe();

    tracing::info!(
        applications = shared.config.enabled_applications().count(),
        flush_interval_ms = settings.flush_interval_ms,
        simulate,
        "pooldeploy daemon starting",
    );

    let intake_handle = {
        let shutdown = shutdown_tx.clone();
        let roots = watch_roots(&shared.config);
        let pending = pending.clone();
        let capacity = settings.event_queue_capacity.max(1);
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = intake_task(roots, normalizer, pending, capacity, rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let flush_handle = {
        let shutdown = shutdown_tx.clone();
        let scheduler = scheduler.clone();
        let coordinator = coordinator.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            scheduler
                .run(
                    |batch| {
                        // Deployments run detached so a long one never holds
                        // up the next flush.
                        let _ = coordinator.dispatch_detached(batch);
                        std::future::ready(())
                    },
                    rx,
                )
                .await;
            Ok::<(), DaemonError>(())
        })
    };

    let health_handle = {
        let shutdown = shutdown_tx.clone();
        let coordinator = coordinator.clone();
        let interval = settings.health_check_interval();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { health_task(coordinator, interval, rx).await })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(shared, shutdown.clone(), rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = shared.home.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = log_rotation_task(home, rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let _ = stop_rx.recv().await;
    tracing::info!("shutdown requested; draining");

    // Intake first, so every queued event lands in the pending set before the
    // final flush.
    let intake_result = intake_handle.await;
    let flush_result = flush_handle.await;
    let remainder = scheduler.flush();
    if !remainder.is_empty() {
        tracing::info!(changes = remainder.len(), "dispatching final flush");
        let _ = coordinator.dispatch_detached(remainder);
    }

    if !coordinator
        .wait_for_idle(settings.shutdown_timeout(), SHUTDOWN_POLL)
        .await
    {
        let abandoned = coordinator.abandon_active();
        tracing::warn!(count = abandoned.len(), "abandoned running deployments");
    }

    let (health_result, socket_result, rotation_result, signal_result) =
        tokio::join!(health_handle, socket_handle, rotation_handle, signal_handle);

    handle_join("intake", intake_result)?;
    handle_join("flush", flush_result)?;
    handle_join("health_check", health_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("pooldeploy daemon stopped");
    Ok(())
}

/// Unique roots of enabled applications; a root inside another root is
/// covered by the outer recursive watch.
fn watch_roots(config: &Config) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = config
        .enabled_applications()
        .flat_map(|app: &ApplicationSpec| app.watch_roots.iter().cloned())
        .collect();
    roots.sort();
    roots.dedup();
    let all = roots.clone();
    roots.retain(|root| {
        !all
            .iter()
            .any(|other| other != root && is_under_root(root, other))
    });
    roots
}

async fn intake_task(
    roots: Vec<PathBuf>,
    normalizer: ChangeNormalizer,
    pending: Arc<PendingChangeSet>,
    capacity: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<Event>>(capacity);
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        if let Err(mpsc::error::TrySendError::Full(_)) = event_tx.try_send(event) {
            tracing::warn!("event queue full; dropping filesystem event");
        }
    })?;

    for root in &roots {
        if !root.exists() {
            tracing::warn!(root = %root.display(), "watch root does not exist; skipping");
            continue;
        }
        watcher.watch(root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), "watching");
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                ingest(&normalizer, &pending, event).await;
            }
        }
    }

    // No new events past this point; drain what was already queued.
    drop(watcher);
    let mut drained = 0usize;
    while let Ok(event) = event_rx.try_recv() {
        ingest(&normalizer, &pending, event).await;
        drained += 1;
    }
    tracing::debug!(drained, "intake stopped");
    Ok(())
}

async fn ingest(
    normalizer: &ChangeNormalizer,
    pending: &Arc<PendingChangeSet>,
    event: notify::Result<Event>,
) {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "watcher event error");
            return;
        }
    };
    let raw = RawEvent::from_notify(&event);
    if raw.is_empty() {
        return;
    }
    let normalizer = normalizer.clone();
    let pending = pending.clone();
    // Hashing reads whole files.
    let stored = tokio::task::spawn_blocking(move || {
        raw.into_iter()
            .filter(|raw| normalizer.ingest(raw.clone(), &pending))
            .count()
    })
    .await;
    if let Err(err) = stored {
        tracing::warn!(error = %err, "normalizer task failed");
    }
}

async fn health_task(
    coordinator: Arc<DeploymentCoordinator>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let drift = health::check_pools(&coordinator).await;
                tracing::debug!(drifted = drift.len(), "health check finished");
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&shared.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let shared = shared.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, shared, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(&shared)),
            "trigger" => handle_trigger(&shared, &request).await,
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn handle_trigger(shared: &Shared, request: &DaemonRequest) -> DaemonResponse {
    let Some(application) = request.application.as_deref() else {
        return DaemonResponse::error("trigger requires an 'application'");
    };
    let since = request.since_minutes.map(|minutes| {
        SystemTime::now()
            .checked_sub(Duration::from_secs(minutes.saturating_mul(60)))
            .unwrap_or(UNIX_EPOCH)
    });
    match shared.coordinator.trigger_manual(application, since).await {
        Ok(admission) => DaemonResponse::ok(admission_payload(&admission)),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

fn admission_payload(admission: &Admission) -> Value {
    match admission {
        Admission::Completed(op) => json!({
            "admitted": true,
            "operation": op,
        }),
        Admission::Skipped(reason) => json!({
            "admitted": false,
            "reason": reason.to_string(),
        }),
    }
}

fn build_status_payload(shared: &Shared) -> Value {
    let coordinator = &shared.coordinator;
    let last = coordinator.last_deployments();
    let active: HashMap<_, _> = coordinator
        .active_operations()
        .into_iter()
        .map(|op| (op.application_name.clone(), op))
        .collect();

    let applications: Vec<Value> = coordinator
        .applications()
        .iter()
        .map(|app| {
            let last = last.get(&app.name);
            json!({
                "name": app.name,
                "pool": app.pool_name,
                "enabled": app.enabled,
                "watch_roots": app.watch_roots,
                "last_deployed_at_unix": last.map(|l| l.finished_at.timestamp()).unwrap_or(0),
                "last_status": last.map(|l| l.status),
                "active_operation": active.get(&app.name).map(|op| op.id.to_string()),
            })
        })
        .collect();

    json!({
        "running": true,
        "label": crate::paths::DAEMON_LABEL,
        "pid": std::process::id(),
        "started_at_unix": shared.started_at_unix,
        "simulate": shared.simulate,
        "pending_changes": shared.pending.len(),
        "flush_interval_ms": shared.config.settings.flush_interval_ms,
        "active_operations": active.len(),
        "applications": applications,
        "socket": socket_path(&shared.home).display().to_string(),
        "config": shared.config_path.display().to_string(),
        "audit_log": audit_log_path(&shared.home).display().to_string(),
    })
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside rotate_logs.
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&home);
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_dir(dir: &Path) -> Result<(), DaemonError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    Ok(())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    ensure_dir(&crate::paths::pooldeploy_root(home))?;
    ensure_dir(&logs_dir(home))?;
    ensure_dir(&audit_dir(home))
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing(log_file: Option<PathBuf>) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            // Reopened per event so rotation never leaves us writing to a
            // renamed file.
            let writer = move || -> Box<dyn std::io::Write> {
                match fs::OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => Box::new(file),
                    Err(_) => Box::new(std::io::sink()),
                }
            };
            let _ = fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .try_init();
        }
        None => {
            let _ = fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
