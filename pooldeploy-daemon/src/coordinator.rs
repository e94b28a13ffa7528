//! Admission control and bookkeeping for deployments.
//!
//! Each routed batch is admitted per application through three checks, in
//! order: dedup (one active operation per application), cooldown since the
//! last finished deployment, and the global execution gate. Dedup and
//! cooldown are evaluated again once the gate permit is held, under the same
//! lock that registers the operation, so two admissions for one application
//! can never both run.
//!
//! An operation leaves the active table exactly once: either its own
//! admission claims it on completion, or shutdown abandons it. Both happen
//! under the state lock, so an operation is audited once.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use pooldeploy_core::{
    ApplicationName, ApplicationSpec, ChangeRecord, Config, DeploymentOperation, ExcludeSet,
    OperationStatus, StepStatus,
};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::error::DaemonError;
use crate::executor::{LiveOperation, StepExecutor};
use crate::normalizer::ChangeNormalizer;
use crate::router::ApplicationRouter;
use crate::scan;

pub const ABANDONED_AT_SHUTDOWN: &str = "abandoned at shutdown";

/// Why an admission did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    AlreadyRunning,
    CoolingDown { remaining: Duration },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "application is disabled"),
            SkipReason::AlreadyRunning => write!(f, "a deployment is already running"),
            SkipReason::CoolingDown { remaining } => {
                write!(f, "cooling down ({}s remaining)", remaining.as_secs().max(1))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The operation ran to a terminal status.
    Completed(DeploymentOperation),
    Skipped(SkipReason),
}

impl Admission {
    pub fn operation(&self) -> Option<&DeploymentOperation> {
        match self {
            Admission::Completed(op) => Some(op),
            Admission::Skipped(_) => None,
        }
    }
}

/// When an application last finished a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastDeployment {
    /// Monotonic; drives the cooldown.
    pub at: Instant,
    pub finished_at: DateTime<Utc>,
    pub status: OperationStatus,
}

#[derive(Debug)]
struct ActiveEntry {
    id: Uuid,
    live: LiveOperation,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    active: HashMap<ApplicationName, ActiveEntry>,
    last: HashMap<ApplicationName, LastDeployment>,
}

impl CoordinatorState {
    fn blocker(&self, name: &ApplicationName, cooldown: Duration) -> Option<SkipReason> {
        if self.active.contains_key(name) {
            return Some(SkipReason::AlreadyRunning);
        }
        let last = self.last.get(name)?;
        let elapsed = Instant::now().saturating_duration_since(last.at);
        (elapsed < cooldown).then(|| SkipReason::CoolingDown {
            remaining: cooldown - elapsed,
        })
    }
}

pub struct DeploymentCoordinator {
    applications: HashMap<ApplicationName, Arc<ApplicationSpec>>,
    router: ApplicationRouter,
    normalizer: ChangeNormalizer,
    executor: StepExecutor,
    audit: Arc<dyn AuditSink>,
    gate: Arc<Semaphore>,
    cooldown: Duration,
    state: Mutex<CoordinatorState>,
    /// Dispatches and manual triggers that have not returned yet, including
    /// those still waiting for the gate.
    in_flight: Arc<AtomicUsize>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DeploymentCoordinator {
    pub fn new(config: &Config, executor: StepExecutor, audit: Arc<dyn AuditSink>) -> Self {
        let settings = &config.settings;
        Self {
            applications: config
                .applications
                .iter()
                .map(|app| (app.name.clone(), Arc::new(app.clone())))
                .collect(),
            router: ApplicationRouter::new(&config.applications),
            normalizer: ChangeNormalizer::new(ExcludeSet::new(&settings.exclude_patterns)),
            executor,
            audit,
            gate: Arc::new(Semaphore::new(settings.max_concurrent_deployments.max(1))),
            cooldown: settings.cooldown(),
            state: Mutex::new(CoordinatorState::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// Every configured application, enabled or not, sorted by name.
    pub fn applications(&self) -> Vec<Arc<ApplicationSpec>> {
        let mut apps: Vec<_> = self.applications.values().cloned().collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        apps
    }

    /// Case-insensitive lookup.
    pub fn application(&self, name: &str) -> Option<Arc<ApplicationSpec>> {
        self.applications
            .values()
            .find(|app| app.name.0.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Route `batch` and admit every affected application concurrently.
    /// Resolves once all admitted operations have finished.
    pub async fn dispatch(
        self: &Arc<Self>,
        batch: Vec<ChangeRecord>,
    ) -> Vec<(ApplicationName, Admission)> {
        let routed = self.router.route(&batch);
        if routed.is_empty() {
            tracing::debug!(changes = batch.len(), "batch matched no application");
            return Vec::new();
        }

        let mut set = JoinSet::new();
        for (name, changes) in routed {
            let coordinator = Arc::clone(self);
            set.spawn(async move {
                let admission = coordinator.deploy(&name, changes).await;
                (name, admission)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(admission))) => results.push((name, admission)),
                Ok((name, Err(err))) => {
                    tracing::error!(application = %name, error = %err, "admission failed")
                }
                Err(err) => tracing::error!(error = %err, "admission task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// [`dispatch`](Self::dispatch) on a background task. The batch counts as
    /// in flight from this call on, so [`wait_for_idle`](Self::wait_for_idle)
    /// sees it even before the task first runs.
    pub fn dispatch_detached(
        self: &Arc<Self>,
        batch: Vec<ChangeRecord>,
    ) -> JoinHandle<Vec<(ApplicationName, Admission)>> {
        let tracked = self.track();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let _tracked = tracked;
            coordinator.dispatch(batch).await
        })
    }

    /// Admit one application with `changes` and run it to completion.
    pub async fn deploy(
        &self,
        name: &ApplicationName,
        changes: Vec<ChangeRecord>,
    ) -> Result<Admission, DaemonError> {
        let app = self
            .application(&name.0)
            .ok_or_else(|| DaemonError::UnknownApplication(name.0.clone()))?;
        if !app.enabled {
            return Ok(self.skipped(&app.name, SkipReason::Disabled));
        }
        let blocked = self.lock().blocker(&app.name, self.cooldown);
        if let Some(reason) = blocked {
            return Ok(self.skipped(&app.name, reason));
        }

        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| DaemonError::ChannelClosed("execution gate"))?;

        let mut op = DeploymentOperation::new(&app, changes);
        op.status = OperationStatus::InProgress;
        let live = LiveOperation::new(&op);
        {
            let mut state = self.lock();
            if let Some(reason) = state.blocker(&app.name, self.cooldown) {
                drop(state);
                return Ok(self.skipped(&app.name, reason));
            }
            state.active.insert(
                app.name.clone(),
                ActiveEntry {
                    id: op.id,
                    live: live.clone(),
                },
            );
        }
        let registration = Registration {
            coordinator: self,
            name: app.name.clone(),
            id: op.id,
        };

        let executor = self.executor.clone();
        let task_app = Arc::clone(&app);
        let task_live = live.clone();
        let joined = tokio::spawn(async move {
            executor.execute_live(&task_app, &mut op, &task_live).await;
            op
        })
        .await;

        let op = match joined {
            Ok(op) => op,
            Err(err) => {
                let reason = if err.is_panic() {
                    format!("deployment panicked: {}", panic_message(err.into_panic()))
                } else {
                    format!("deployment task cancelled: {err}")
                };
                // Keep whatever steps ran before the task died.
                let mut op = live.snapshot();
                tracing::error!(id = %op.id, application = %app.name, "{reason}");
                op.record_error(reason);
                op.finish(OperationStatus::Failed);
                op
            }
        };

        if registration.claim(&op) {
            self.audit.record(op.clone());
        } else {
            tracing::warn!(id = %op.id, application = %app.name, "finished after being abandoned");
        }
        drop(registration);
        drop(permit);
        Ok(Admission::Completed(op))
    }

    /// Rescan the application's watch roots and deploy whatever changed at or
    /// after `since` (everything when `None`). An empty rescan still deploys.
    pub async fn trigger_manual(
        &self,
        name: &str,
        since: Option<SystemTime>,
    ) -> Result<Admission, DaemonError> {
        let _tracked = self.track();
        let app = self
            .application(name)
            .ok_or_else(|| DaemonError::UnknownApplication(name.to_string()))?;
        let roots = app.watch_roots.clone();
        let normalizer = self.normalizer.clone();
        let exclude = ExcludeSet::new(&app.exclude_patterns);
        let changes = tokio::task::spawn_blocking(move || {
            scan::rescan(&roots, since, &normalizer, &exclude)
        })
        .await
        .map_err(|err| DaemonError::Protocol(format!("rescan task failed: {err}")))??;

        tracing::info!(
            application = %app.name,
            changes = changes.len(),
            "manual deployment requested",
        );
        self.deploy(&app.name, changes).await
    }

    /// Snapshots of in-flight operations, sorted by application.
    pub fn active_operations(&self) -> Vec<DeploymentOperation> {
        let mut ops: Vec<_> = self
            .lock()
            .active
            .values()
            .map(|entry| entry.live.snapshot())
            .collect();
        ops.sort_by(|a, b| a.application_name.cmp(&b.application_name));
        ops
    }

    pub fn is_active(&self, name: &ApplicationName) -> bool {
        self.lock().active.contains_key(name)
    }

    pub fn last_deployments(&self) -> HashMap<ApplicationName, LastDeployment> {
        self.lock().last.clone()
    }

    /// Poll every `poll` until nothing is active or in flight. Returns whether
    /// that happened within `timeout`.
    pub async fn wait_for_idle(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let active = self.lock().active.len();
            let in_flight = self.in_flight.load(Ordering::SeqCst);
            if active == 0 && in_flight == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(active, in_flight, "deployments still running at shutdown deadline");
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Close the gate, untrack every running operation and audit it as
    /// failed, with the steps it got through and any open step marked
    /// failed. The running work itself is left alone; admissions still
    /// waiting for the gate fail with [`DaemonError::ChannelClosed`].
    pub fn abandon_active(&self) -> Vec<DeploymentOperation> {
        self.gate.close();
        let abandoned: Vec<LiveOperation> = {
            let mut state = self.lock();
            state.active.drain().map(|(_, entry)| entry.live).collect()
        };
        abandoned
            .into_iter()
            .map(|live| {
                let mut op = live.snapshot();
                // Finished but not yet claimed: audit it as it ended.
                if !op.is_terminal() {
                    for step in op
                        .steps
                        .iter_mut()
                        .filter(|step| step.status == StepStatus::InProgress)
                    {
                        step.fail(ABANDONED_AT_SHUTDOWN);
                    }
                    op.record_error(ABANDONED_AT_SHUTDOWN);
                    op.finish(OperationStatus::Failed);
                    tracing::warn!(id = %op.id, application = %op.application_name, "{ABANDONED_AT_SHUTDOWN}");
                }
                self.audit.record(op.clone());
                op
            })
            .collect()
    }

    fn skipped(&self, name: &ApplicationName, reason: SkipReason) -> Admission {
        tracing::debug!(application = %name, ?reason, "deployment skipped");
        Admission::Skipped(reason)
    }

    fn track(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(Arc::clone(&self.in_flight))
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the active entry when dropped, unless it was claimed, abandoned
/// or replaced.
struct Registration<'a> {
    coordinator: &'a DeploymentCoordinator,
    name: ApplicationName,
    id: Uuid,
}

impl Registration<'_> {
    /// Take the finished operation out of the active table and stamp the
    /// cooldown. False when shutdown already abandoned it.
    fn claim(&self, op: &DeploymentOperation) -> bool {
        let mut state = self.coordinator.lock();
        if !state.active.get(&self.name).is_some_and(|entry| entry.id == self.id) {
            return false;
        }
        state.active.remove(&self.name);
        state.last.insert(
            self.name.clone(),
            LastDeployment {
                at: Instant::now(),
                finished_at: op.end_time.unwrap_or_else(Utc::now),
                status: op.status,
            },
        );
        true
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.lock();
        if state.active.get(&self.name).is_some_and(|entry| entry.id == self.id) {
            state.active.remove(&self.name);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
