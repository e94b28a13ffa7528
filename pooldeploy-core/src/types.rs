//! Domain types for pooldeploy.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! All types are serializable via serde so operations can be audited as JSON
//! and application specs can be loaded from YAML.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a configured application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationName(pub String);

impl fmt::Display for ApplicationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ApplicationName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ApplicationName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Change records
// ---------------------------------------------------------------------------

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Renamed => write!(f, "renamed"),
        }
    }
}

/// A single normalized filesystem change.
///
/// `size` is `0` and `content_hash` is `None` for deletions and for files that
/// could not be read when the event was normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Previous path; only set for [`ChangeKind::Renamed`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<PathBuf>,
}

impl ChangeRecord {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            detected_at: Utc::now(),
            size: 0,
            content_hash: None,
            old_path: None,
        }
    }

    pub fn renamed(old_path: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        let mut record = Self::new(path, ChangeKind::Renamed);
        record.old_path = Some(old_path.into());
        record
    }
}

// ---------------------------------------------------------------------------
// Application spec
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

/// One deployable application: the pool it runs in, the directories whose
/// changes trigger it, and where its files are copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: ApplicationName,
    pub pool_name: String,
    /// A change belongs to the application when any root is a prefix of its path.
    pub watch_roots: Vec<PathBuf>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    pub source_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_root: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub copy_enabled: bool,
    /// Falls back to `settings.max_retries` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Upper bound for the copy phase of one deployment.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ApplicationSpec {
    /// Minimal enabled spec with copy turned off; mostly useful for tests and
    /// for building specs programmatically.
    pub fn new(name: impl Into<ApplicationName>, pool_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool_name: pool_name.into(),
            watch_roots: Vec::new(),
            exclude_patterns: Vec::new(),
            source_root: PathBuf::new(),
            destination_root: None,
            copy_enabled: false,
            max_retries: None,
            timeout_secs: default_timeout_secs(),
            enabled: true,
        }
    }

    pub fn with_watch_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if self.source_root.as_os_str().is_empty() {
            self.source_root = root.clone();
        }
        self.watch_roots.push(root);
        self
    }

    pub fn with_copy(
        mut self,
        source_root: impl Into<PathBuf>,
        destination_root: impl Into<PathBuf>,
    ) -> Self {
        self.source_root = source_root.into();
        self.destination_root = Some(destination_root.into());
        self.copy_enabled = true;
        self
    }

    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_retries_or(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default).max(1)
    }

    /// Map a changed source path onto the destination tree.
    ///
    /// Returns `None` when the path is outside `source_root` or the
    /// application has no destination.
    pub fn destination_for(&self, source: &Path) -> Option<PathBuf> {
        let destination_root = self.destination_root.as_ref()?;
        let relative = source.strip_prefix(&self.source_root).ok()?;
        Some(destination_root.join(relative))
    }
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

/// Runtime state reported by the pool controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Starting,
    Started,
    Stopping,
    Stopped,
    #[default]
    Unknown,
}

impl PoolState {
    /// Lenient parse of controller output (`"Started"`, `"running"`, `"state:Stopped"`...).
    pub fn parse_loose(text: &str) -> Self {
        let text = text.trim().to_ascii_lowercase();
        if text.contains("stopping") {
            PoolState::Stopping
        } else if text.contains("starting") {
            PoolState::Starting
        } else if text.contains("stopped") {
            PoolState::Stopped
        } else if text.contains("started") || text.contains("running") {
            PoolState::Started
        } else {
            PoolState::Unknown
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Starting => write!(f, "starting"),
            PoolState::Started => write!(f, "started"),
            PoolState::Stopping => write!(f, "stopping"),
            PoolState::Stopped => write!(f, "stopped"),
            PoolState::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Deployment operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::InProgress => write!(f, "in_progress"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// The pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    StopPool,
    CopyFiles,
    StartPool,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::StopPool => write!(f, "stop pool"),
            StepKind::CopyFiles => write!(f, "copy files"),
            StepKind::StartPool => write!(f, "start pool"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Copy,
    Delete,
}

/// Result of transferring one file inside a copy step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub action: FileAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub destination: PathBuf,
    pub attempts: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One stage of a deployment.
///
/// Once appended to an operation only its closing fields change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub kind: StepKind,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileOutcome>,
}

impl DeploymentStep {
    pub fn begin(kind: StepKind) -> Self {
        Self {
            kind,
            start_time: Utc::now(),
            end_time: None,
            status: StepStatus::InProgress,
            error_message: None,
            files: Vec::new(),
        }
    }

    pub fn skipped(kind: StepKind) -> Self {
        let mut step = Self::begin(kind);
        step.status = StepStatus::Skipped;
        step.end_time = Some(step.start_time);
        step
    }

    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error_message = Some(message.into());
        self.end_time = Some(Utc::now());
    }

    /// Completed and Skipped both let the pipeline continue.
    pub fn succeeded(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// One run of the stop → copy → start pipeline for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOperation {
    pub id: Uuid,
    pub application_name: ApplicationName,
    pub pool_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: OperationStatus,
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
    #[serde(default)]
    pub steps: Vec<DeploymentStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeploymentOperation {
    pub fn new(app: &ApplicationSpec, changes: Vec<ChangeRecord>) -> Self {
        Self {
            id: Uuid::new_v4(),
            application_name: app.name.clone(),
            pool_name: app.pool_name.clone(),
            start_time: Utc::now(),
            end_time: None,
            status: OperationStatus::Pending,
            changes,
            steps: Vec::new(),
            error_message: None,
        }
    }

    /// Append a step and return the index it landed at.
    pub fn push_step(&mut self, step: DeploymentStep) -> usize {
        self.steps.push(step);
        self.steps.len() - 1
    }

    /// Record the first failure; later failures never overwrite it.
    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
    }

    pub fn finish(&mut self, status: OperationStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Completed | OperationStatus::Failed
        )
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }

    pub fn step(&self, kind: StepKind) -> Option<&DeploymentStep> {
        self.steps.iter().find(|step| step.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
