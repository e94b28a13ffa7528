//! Application pool controllers.
//!
//! [`PoolController`] is the seam between the deployment pipeline and the
//! host's runtime. [`CommandPoolController`] drives the host through
//! configured commands (`appcmd` by default); [`MemoryPoolController`] keeps
//! pools in memory and is used for simulation and tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use pooldeploy_core::config::{render_command, PoolSettings};
use pooldeploy_core::PoolState;
use tokio::process::Command;
use tokio::time::Instant;

use crate::error::PoolError;

#[async_trait]
pub trait PoolController: Send + Sync {
    /// Stop the pool and wait for it to report `Stopped`.
    ///
    /// `Ok(false)` means the pool did not get there in time.
    async fn stop(&self, pool: &str) -> Result<bool, PoolError>;

    /// Start the pool and wait for it to report `Started`.
    async fn start(&self, pool: &str) -> Result<bool, PoolError>;

    async fn state(&self, pool: &str) -> Result<PoolState, PoolError>;

    async fn exists(&self, pool: &str) -> Result<bool, PoolError>;

    async fn list_pools(&self) -> Result<Vec<String>, PoolError>;

    async fn list_sites(&self) -> Result<Vec<String>, PoolError>;
}

// ---------------------------------------------------------------------------
// Command controller
// ---------------------------------------------------------------------------

/// Runs the argv templates from `settings.pool.commands`.
#[derive(Debug, Clone)]
pub struct CommandPoolController {
    settings: PoolSettings,
}

impl CommandPoolController {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }

    async fn run(
        &self,
        label: &'static str,
        template: &[String],
        pool: &str,
    ) -> Result<String, PoolError> {
        let argv = render_command(template, pool);
        let Some((program, args)) = argv.split_first() else {
            return Err(PoolError::EmptyCommand(label));
        };
        let command = argv.join(" ");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| PoolError::Spawn {
                command: command.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("access is denied") || lowered.contains("permission denied") {
            return Err(PoolError::AccessDenied {
                pool: pool.to_string(),
                message: stderr,
            });
        }
        Err(PoolError::CommandFailed {
            command,
            status: output.status.to_string(),
            stderr,
        })
    }

    /// `state`, with a failed query read as `Unknown`. Spawn and access
    /// failures still surface.
    async fn observed_state(&self, pool: &str) -> Result<PoolState, PoolError> {
        match self.state(pool).await {
            Err(PoolError::CommandFailed {
                command,
                status,
                stderr,
            }) => {
                tracing::debug!(pool, %command, %status, %stderr, "state query failed");
                Ok(PoolState::Unknown)
            }
            other => other,
        }
    }

    /// Poll `state` until it reports `target` or `timeout` elapses.
    async fn wait_for(
        &self,
        pool: &str,
        target: PoolState,
        timeout: Duration,
    ) -> Result<bool, PoolError> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.observed_state(pool).await?;
            if state == target {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                tracing::warn!(pool, %state, %target, "timed out waiting for pool state");
                return Ok(false);
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }
}

#[async_trait]
impl PoolController for CommandPoolController {
    async fn stop(&self, pool: &str) -> Result<bool, PoolError> {
        // The stop command errors on an already-stopped pool.
        if self.observed_state(pool).await? == PoolState::Stopped {
            return Ok(true);
        }
        self.run("stop", &self.settings.commands.stop, pool).await?;
        self.wait_for(pool, PoolState::Stopped, self.settings.stop_timeout())
            .await
    }

    async fn start(&self, pool: &str) -> Result<bool, PoolError> {
        if self.observed_state(pool).await? == PoolState::Started {
            return Ok(true);
        }
        self.run("start", &self.settings.commands.start, pool).await?;
        self.wait_for(pool, PoolState::Started, self.settings.start_timeout())
            .await
    }

    async fn state(&self, pool: &str) -> Result<PoolState, PoolError> {
        let output = self.run("state", &self.settings.commands.state, pool).await?;
        Ok(PoolState::parse_loose(&output))
    }

    async fn exists(&self, pool: &str) -> Result<bool, PoolError> {
        match self.run("state", &self.settings.commands.state, pool).await {
            Ok(output) => Ok(!output.trim().is_empty()),
            Err(PoolError::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_pools(&self) -> Result<Vec<String>, PoolError> {
        let output = self.run("list_pools", &self.settings.commands.list_pools, "").await?;
        Ok(non_empty_lines(&output))
    }

    async fn list_sites(&self) -> Result<Vec<String>, PoolError> {
        let output = self.run("list_sites", &self.settings.commands.list_sites, "").await?;
        Ok(non_empty_lines(&output))
    }
}

fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory controller
// ---------------------------------------------------------------------------

/// A call observed by [`MemoryPoolController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolCall {
    Stop(String),
    Start(String),
}

#[derive(Debug, Default)]
struct MemoryPools {
    states: HashMap<String, PoolState>,
    failing_stop: HashSet<String>,
    failing_start: HashSet<String>,
    calls: Vec<PoolCall>,
}

/// In-process pools. Stop/start succeed immediately (after an optional
/// latency) unless a failure was injected for that pool.
#[derive(Debug, Default)]
pub struct MemoryPoolController {
    inner: Mutex<MemoryPools>,
    stop_latency: Duration,
    start_latency: Duration,
}

impl MemoryPoolController {
    /// Every named pool starts out `Started`.
    pub fn with_pools<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let controller = Self::default();
        {
            let mut inner = controller.lock();
            for pool in pools {
                inner.states.insert(pool.into(), PoolState::Started);
            }
        }
        controller
    }

    /// Delay every stop/start by `latency` (tokio time, so paused clocks apply).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.stop_latency = latency;
        self.start_latency = latency;
        self
    }

    /// Delay only `start`.
    pub fn with_start_latency(mut self, latency: Duration) -> Self {
        self.start_latency = latency;
        self
    }

    /// Make `stop` on `pool` report a timeout.
    pub fn fail_stop(&self, pool: &str) {
        self.lock().failing_stop.insert(pool.to_string());
    }

    /// Make `start` on `pool` report a timeout.
    pub fn fail_start(&self, pool: &str) {
        self.lock().failing_start.insert(pool.to_string());
    }

    pub fn set_state(&self, pool: &str, state: PoolState) {
        self.lock().states.insert(pool.to_string(), state);
    }

    pub fn current_state(&self, pool: &str) -> Option<PoolState> {
        self.lock().states.get(pool).copied()
    }

    pub fn calls(&self) -> Vec<PoolCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryPools> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn transition(&self, pool: &str, target: PoolState) -> Result<bool, PoolError> {
        {
            let mut inner = self.lock();
            inner.calls.push(match target {
                PoolState::Stopped => PoolCall::Stop(pool.to_string()),
                _ => PoolCall::Start(pool.to_string()),
            });
            if !inner.states.contains_key(pool) {
                return Err(PoolError::NotFound(pool.to_string()));
            }
        }
        let latency = match target {
            PoolState::Stopped => self.stop_latency,
            _ => self.start_latency,
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.lock();
        let failing = match target {
            PoolState::Stopped => inner.failing_stop.contains(pool),
            _ => inner.failing_start.contains(pool),
        };
        if failing {
            return Ok(false);
        }
        inner.states.insert(pool.to_string(), target);
        Ok(true)
    }
}

#[async_trait]
impl PoolController for MemoryPoolController {
    async fn stop(&self, pool: &str) -> Result<bool, PoolError> {
        self.transition(pool, PoolState::Stopped).await
    }

    async fn start(&self, pool: &str) -> Result<bool, PoolError> {
        self.transition(pool, PoolState::Started).await
    }

    async fn state(&self, pool: &str) -> Result<PoolState, PoolError> {
        Ok(self.current_state(pool).unwrap_or(PoolState::Unknown))
    }

    async fn exists(&self, pool: &str) -> Result<bool, PoolError> {
        Ok(self.lock().states.contains_key(pool))
    }

    async fn list_pools(&self) -> Result<Vec<String>, PoolError> {
        let mut pools: Vec<String> = self.lock().states.keys().cloned().collect();
        pools.sort();
        Ok(pools)
    }

    async fn list_sites(&self) -> Result<Vec<String>, PoolError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pooldeploy_core::PoolCommands;

    #[tokio::test]
    async fn memory_pool_transitions_and_records_calls() {
        let pools = MemoryPoolController::with_pools(["ApiPool"]);
        assert!(pools.stop("ApiPool").await.unwrap());
        assert_eq!(pools.state("ApiPool").await.unwrap(), PoolState::Stopped);
        assert!(pools.start("ApiPool").await.unwrap());
        assert_eq!(
            pools.calls(),
            vec![
                PoolCall::Stop("ApiPool".into()),
                PoolCall::Start("ApiPool".into())
            ]
        );
    }

    #[tokio::test]
    async fn memory_pool_injected_failure_reports_timeout() {
        let pools = MemoryPoolController::with_pools(["ApiPool"]);
        pools.fail_stop("ApiPool");
        assert!(!pools.stop("ApiPool").await.unwrap());
        assert_eq!(pools.current_state("ApiPool"), Some(PoolState::Started));
    }

    #[tokio::test]
    async fn memory_pool_unknown_pool_is_an_error() {
        let pools = MemoryPoolController::default();
        assert!(matches!(
            pools.stop("Nope").await,
            Err(PoolError::NotFound(_))
        ));
        assert!(!pools.exists("Nope").await.unwrap());
    }

    fn shell_settings(state_script: &str) -> PoolSettings {
        let sh = |script: &str| vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        PoolSettings {
            stop_timeout_secs: 1,
            start_timeout_secs: 1,
            poll_interval_ms: 10,
            commands: PoolCommands {
                stop: sh("true"),
                start: sh("true"),
                state: sh(state_script),
                list_pools: sh("printf 'ApiPool\\n\\nWebPool\\n'"),
                list_sites: sh("printf 'Default Web Site\\n'"),
            },
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_controller_parses_state_and_lists() {
        let controller = CommandPoolController::new(shell_settings("echo Started"));
        assert_eq!(controller.state("ApiPool").await.unwrap(), PoolState::Started);
        assert!(controller.exists("ApiPool").await.unwrap());
        assert_eq!(controller.list_pools().await.unwrap(), vec!["ApiPool", "WebPool"]);
        assert_eq!(controller.list_sites().await.unwrap(), vec!["Default Web Site"]);
        // Already started: no start command needed, reports success.
        assert!(controller.start("ApiPool").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_controller_times_out_with_false() {
        let controller = CommandPoolController::new(shell_settings("echo Started"));
        // State never becomes Stopped, so stop must give up after the timeout.
        assert!(!controller.stop("ApiPool").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_controller_maps_failures() {
        let controller =
            CommandPoolController::new(shell_settings("echo 'Permission denied' >&2; exit 1"));
        assert!(matches!(
            controller.state("ApiPool").await,
            Err(PoolError::AccessDenied { .. })
        ));

        let missing = CommandPoolController::new(shell_settings("exit 3"));
        assert!(!missing.exists("ApiPool").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_state_query_while_polling_times_out_with_false() {
        let controller = CommandPoolController::new(shell_settings("exit 1"));
        assert!(!controller.stop("ApiPool").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_query_that_recovers_lets_stop_succeed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let marker = tmp.path().join("queried");
        // First query fails, every later one reports Stopped.
        let script = format!(
            "if [ -f '{0}' ]; then echo Stopped; else touch '{0}'; exit 1; fi",
            marker.display()
        );
        let controller = CommandPoolController::new(shell_settings(&script));
        assert!(controller.stop("ApiPool").await.unwrap());
        assert!(marker.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn memory_pool_start_latency_leaves_stop_immediate() {
        let pools = MemoryPoolController::with_pools(["ApiPool"])
            .with_start_latency(Duration::from_millis(50));
        let stop = Instant::now();
        assert!(pools.stop("ApiPool").await.unwrap());
        assert!(stop.elapsed() < Duration::from_millis(50));
        let start = Instant::now();
        assert!(pools.start("ApiPool").await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn command_controller_spawn_failure_is_an_error() {
        let mut settings = shell_settings("true");
        settings.commands.state = vec!["pooldeploy-definitely-missing-binary".to_string()];
        let controller = CommandPoolController::new(settings);
        assert!(matches!(
            controller.state("ApiPool").await,
            Err(PoolError::Spawn { .. })
        ));
    }
}
