//! The stop → copy → start pipeline for one deployment.
//!
//! A failed stop ends the operation on the spot. Once the pool has been
//! stopped, the start step always runs so a broken copy never leaves the
//! application down. A copy phase that runs past the application timeout
//! cancels its transfers and waits for them to stop before the pool is
//! started again.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pooldeploy_core::types::FileAction;
use pooldeploy_core::{
    ApplicationSpec, ChangeKind, ChangeRecord, DeploymentOperation, DeploymentStep, FileOutcome,
    OperationStatus, Settings, StepKind,
};
use pooldeploy_sync::{CancelFlag, FileTransfer, RetryPolicy};
use tokio::task::JoinSet;

use crate::error::PoolError;
use crate::pool::PoolController;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransferJob {
    Copy {
        source: PathBuf,
        destination: PathBuf,
    },
    Delete {
        destination: PathBuf,
    },
    /// A change with no place in the destination tree.
    Unmapped {
        path: PathBuf,
        action: FileAction,
        reason: String,
    },
}

impl TransferJob {
    fn run(
        &self,
        transfer: &dyn FileTransfer,
        policy: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> FileOutcome {
        match self {
            TransferJob::Copy {
                source,
                destination,
            } => transfer.copy(source, destination, policy, cancel),
            TransferJob::Delete { destination } => transfer.delete(destination, policy, cancel),
            TransferJob::Unmapped {
                path,
                action,
                reason,
            } => FileOutcome {
                action: *action,
                source: Some(path.clone()),
                destination: path.clone(),
                attempts: 0,
                success: false,
                error: Some(format!("{}: {reason}", path.display())),
            },
        }
    }
}

/// An operation shared between the executor running it and observers such
/// as the coordinator's active table.
#[derive(Debug, Clone)]
pub struct LiveOperation(Arc<Mutex<DeploymentOperation>>);

impl LiveOperation {
    pub fn new(op: &DeploymentOperation) -> Self {
        Self(Arc::new(Mutex::new(op.clone())))
    }

    pub fn snapshot(&self) -> DeploymentOperation {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn publish(&self, op: &DeploymentOperation) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone_from(op);
    }
}

fn publish(live: Option<&LiveOperation>, op: &DeploymentOperation) {
    if let Some(live) = live {
        live.publish(op);
    }
}

/// Runs deployment steps against a pool controller and a file transfer.
#[derive(Clone)]
pub struct StepExecutor {
    pools: Arc<dyn PoolController>,
    transfer: Arc<dyn FileTransfer>,
    default_max_retries: u32,
    retry_delay: Duration,
}

impl StepExecutor {
    pub fn new(
        pools: Arc<dyn PoolController>,
        transfer: Arc<dyn FileTransfer>,
        settings: &Settings,
    ) -> Self {
        Self {
            pools,
            transfer,
            default_max_retries: settings.max_retries,
            retry_delay: settings.retry_delay(),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.default_max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    pub fn pools(&self) -> &Arc<dyn PoolController> {
        &self.pools
    }

    /// Drive `op` to a terminal status. Never returns an error: every failure
    /// lands in the operation's steps and `error_message`.
    pub async fn execute(&self, app: &ApplicationSpec, op: &mut DeploymentOperation) {
        self.run(app, op, None).await;
    }

    /// [`execute`](Self::execute), copying `op` into `live` every time a step
    /// begins or ends.
    pub async fn execute_live(
        &self,
        app: &ApplicationSpec,
        op: &mut DeploymentOperation,
        live: &LiveOperation,
    ) {
        self.run(app, op, Some(live)).await;
    }

    async fn run(
        &self,
        app: &ApplicationSpec,
        op: &mut DeploymentOperation,
        live: Option<&LiveOperation>,
    ) {
        op.status = OperationStatus::InProgress;
        publish(live, op);
        tracing::info!(
            id = %op.id,
            application = %app.name,
            pool = %app.pool_name,
            changes = op.changes.len(),
            "deployment started",
        );

        if self.stop_pool(app, op, live).await {
            self.copy_files(app, op, live).await;
            self.start_pool(app, op, live).await;
        }

        op.finish(if op.steps.iter().all(DeploymentStep::succeeded) {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        });
        publish(live, op);
    }

    async fn stop_pool(
        &self,
        app: &ApplicationSpec,
        op: &mut DeploymentOperation,
        live: Option<&LiveOperation>,
    ) -> bool {
        let index = op.push_step(DeploymentStep::begin(StepKind::StopPool));
        publish(live, op);
        let result = self.pools.stop(&app.pool_name).await;
        let stopped = close_pool_step(op, index, &app.pool_name, "stop", result);
        publish(live, op);
        stopped
    }

    async fn start_pool(
        &self,
        app: &ApplicationSpec,
        op: &mut DeploymentOperation,
        live: Option<&LiveOperation>,
    ) {
        let index = op.push_step(DeploymentStep::begin(StepKind::StartPool));
        publish(live, op);
        let result = self.pools.start(&app.pool_name).await;
        close_pool_step(op, index, &app.pool_name, "start", result);
        publish(live, op);
    }

    async fn copy_files(
        &self,
        app: &ApplicationSpec,
        op: &mut DeploymentOperation,
        live: Option<&LiveOperation>,
    ) {
        if !app.copy_enabled {
            op.push_step(DeploymentStep::skipped(StepKind::CopyFiles));
            publish(live, op);
            return;
        }
        let index = op.push_step(DeploymentStep::begin(StepKind::CopyFiles));
        publish(live, op);

        let jobs = plan_transfers(app, &op.changes);
        let total = jobs.len();
        let policy = RetryPolicy::new(
            app.max_retries_or(self.default_max_retries),
            self.retry_delay,
        );

        let cancel = CancelFlag::new();
        let mut set = JoinSet::new();
        for (position, job) in jobs.into_iter().enumerate() {
            let transfer = Arc::clone(&self.transfer);
            let cancel = cancel.clone();
            set.spawn_blocking(move || (position, job.run(transfer.as_ref(), &policy, &cancel)));
        }

        let mut outcomes: Vec<(usize, FileOutcome)> = Vec::with_capacity(total);
        let mut lost: Vec<String> = Vec::new();
        let timed_out = tokio::time::timeout(
            app.timeout(),
            collect_transfers(&mut set, &mut outcomes, &mut lost),
        )
        .await
        .is_err();
        if timed_out {
            // Running transfers cannot be aborted; they stop at their next
            // cancellation check and must be gone before the pool restarts.
            cancel.cancel();
            tracing::warn!(
                id = %op.id,
                running = set.len(),
                "copy phase timed out; waiting for running transfers to stop",
            );
            collect_transfers(&mut set, &mut outcomes, &mut lost).await;
        }

        outcomes.sort_by_key(|(position, _)| *position);
        let files: Vec<FileOutcome> = outcomes.into_iter().map(|(_, outcome)| outcome).collect();
        let failed: Vec<&FileOutcome> = files.iter().filter(|f| !f.success).collect();

        let message = if timed_out {
            Some(format!(
                "copy phase exceeded {}s timeout; {} of {total} file transfer(s) finished",
                app.timeout_secs,
                files.len() - failed.len()
            ))
        } else if !failed.is_empty() || !lost.is_empty() {
            let first = failed
                .first()
                .and_then(|f| f.error.clone())
                .or_else(|| lost.first().cloned())
                .unwrap_or_default();
            Some(format!(
                "{} of {total} file transfer(s) failed; first: {first}",
                failed.len() + lost.len()
            ))
        } else {
            None
        };

        let id = op.id;
        let step = &mut op.steps[index];
        step.files = files;
        match message {
            None => {
                step.complete();
                tracing::info!(%id, files = total, "copy step completed");
            }
            Some(message) => {
                tracing::warn!(%id, "{message}");
                step.fail(message.clone());
                op.record_error(message);
            }
        }
        publish(live, op);
    }
}

async fn collect_transfers(
    set: &mut JoinSet<(usize, FileOutcome)>,
    outcomes: &mut Vec<(usize, FileOutcome)>,
    lost: &mut Vec<String>,
) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(done) => outcomes.push(done),
            Err(err) => lost.push(format!("transfer task failed: {err}")),
        }
    }
}

fn close_pool_step(
    op: &mut DeploymentOperation,
    index: usize,
    pool: &str,
    verb: &str,
    result: Result<bool, PoolError>,
) -> bool {
    let message = match result {
        Ok(true) => {
            op.steps[index].complete();
            tracing::info!(id = %op.id, pool, "{verb} pool completed");
            return true;
        }
        Ok(false) => format!("failed to {verb} pool '{pool}': timed out waiting for state change"),
        Err(err) => format!("failed to {verb} pool '{pool}': {err}"),
    };
    tracing::warn!(id = %op.id, pool, "{message}");
    op.steps[index].fail(message.clone());
    op.record_error(message);
    false
}

/// One job per destination file touched by `changes`.
fn plan_transfers(app: &ApplicationSpec, changes: &[ChangeRecord]) -> Vec<TransferJob> {
    let mut jobs = Vec::with_capacity(changes.len());
    for change in changes {
        let destination = app.destination_for(&change.path);
        match change.kind {
            ChangeKind::Created | ChangeKind::Modified => jobs.push(match destination {
                Some(destination) => TransferJob::Copy {
                    source: change.path.clone(),
                    destination,
                },
                None => unmapped(app, &change.path, FileAction::Copy),
            }),
            ChangeKind::Deleted => jobs.push(match destination {
                Some(destination) => TransferJob::Delete { destination },
                None => unmapped(app, &change.path, FileAction::Delete),
            }),
            ChangeKind::Renamed => {
                let old_destination = change
                    .old_path
                    .as_deref()
                    .and_then(|old| app.destination_for(old))
                    .filter(|old| {
                        // Case-only renames land on the same file.
                        destination
                            .as_deref()
                            .map_or(true, |new| !same_path_ignoring_case(old, new))
                    });
                if old_destination.is_none() && destination.is_none() {
                    jobs.push(unmapped(app, &change.path, FileAction::Copy));
                }
                if let Some(old) = old_destination {
                    jobs.push(TransferJob::Delete { destination: old });
                }
                if let Some(destination) = destination {
                    jobs.push(TransferJob::Copy {
                        source: change.path.clone(),
                        destination,
                    });
                }
            }
        }
    }
    jobs
}

fn unmapped(app: &ApplicationSpec, path: &Path, action: FileAction) -> TransferJob {
    let reason = if app.destination_root.is_none() {
        "no destination root configured".to_string()
    } else {
        format!("outside source root {}", app.source_root.display())
    };
    TransferJob::Unmapped {
        path: path.to_path_buf(),
        action,
        reason,
    }
}

fn same_path_ignoring_case(a: &Path, b: &Path) -> bool {
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}
