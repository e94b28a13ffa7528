//! Audit sinks for finished deployment operations.
//!
//! `record` must never block the coordinator for long and must never fail a
//! deployment, so every sink here swallows its own errors.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use pooldeploy_core::{DeploymentOperation, OperationStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{io_err, DaemonError};

pub trait AuditSink: Send + Sync {
    fn record(&self, operation: DeploymentOperation);
}

/// Logs a one-line summary per operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, operation: DeploymentOperation) {
        let steps: Vec<String> = operation
            .steps
            .iter()
            .map(|s| format!("{}={:?}", s.kind, s.status))
            .collect();
        match operation.status {
            OperationStatus::Completed => tracing::info!(
                id = %operation.id,
                application = %operation.application_name,
                pool = %operation.pool_name,
                changes = operation.changes.len(),
                duration_ms = operation.duration_ms().unwrap_or_default(),
                steps = %steps.join(", "),
                "deployment completed",
            ),
            _ => tracing::error!(
                id = %operation.id,
                application = %operation.application_name,
                pool = %operation.pool_name,
                status = %operation.status,
                error = operation.error_message.as_deref().unwrap_or("unknown error"),
                steps = %steps.join(", "),
                "deployment failed",
            ),
        }
    }
}

/// Keeps every operation in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    operations: Mutex<Vec<DeploymentOperation>>,
}

impl MemoryAuditSink {
    pub fn operations(&self) -> Vec<DeploymentOperation> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, operation: DeploymentOperation) {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(operation);
    }
}

/// Appends one JSON document per line to an audit file.
///
/// `record` only enqueues; a background task does the writing. The task ends
/// once every clone of the sink has been dropped and the queue is drained.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    tx: mpsc::UnboundedSender<DeploymentOperation>,
}

impl JsonlAuditSink {
    pub fn spawn(path: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeploymentOperation>();
        let handle = tokio::spawn(async move {
            while let Some(operation) = rx.recv().await {
                let path = path.clone();
                let id = operation.id;
                let written =
                    tokio::task::spawn_blocking(move || append_json_line(&path, &operation)).await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(%id, error = %err, "audit write failed"),
                    Err(err) => tracing::warn!(%id, error = %err, "audit writer task failed"),
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, operation: DeploymentOperation) {
        if self.tx.send(operation).is_err() {
            tracing::warn!("audit writer has stopped; operation not persisted");
        }
    }
}

/// Forwards to several sinks in order.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, operation: DeploymentOperation) {
        for sink in &self.sinks {
            sink.record(operation.clone());
        }
    }
}

fn append_json_line(path: &Path, operation: &DeploymentOperation) -> Result<(), DaemonError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let mut line = serde_json::to_vec(operation)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    file.write_all(&line).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Read back an audit file; malformed lines are skipped.
pub fn read_audit_log(path: &Path) -> Result<Vec<DeploymentOperation>, DaemonError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(path, err)),
    };
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pooldeploy_core::ApplicationSpec;
    use tempfile::TempDir;

    fn finished(name: &str, status: OperationStatus) -> DeploymentOperation {
        let app = ApplicationSpec::new(name, format!("{name}Pool"));
        let mut op = DeploymentOperation::new(&app, vec![]);
        op.finish(status);
        op
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_operation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit/deployments.jsonl");
        let (sink, writer) = JsonlAuditSink::spawn(path.clone());

        sink.record(finished("API", OperationStatus::Completed));
        sink.record(finished("Web", OperationStatus::Failed));
        drop(sink);
        writer.await.expect("writer task");

        let ops = read_audit_log(&path).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].application_name.0, "API");
        assert_eq!(ops[1].status, OperationStatus::Failed);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAuditSink::default());
        let b = Arc::new(MemoryAuditSink::default());
        let sinks: Vec<Arc<dyn AuditSink>> = vec![a.clone(), b.clone(), Arc::new(TracingAuditSink)];
        let fanout = FanoutAuditSink::new(sinks);
        fanout.record(finished("API", OperationStatus::Completed));
        assert_eq!(a.operations().len(), 1);
        assert_eq!(b.operations().len(), 1);
    }

    #[test]
    fn missing_audit_log_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(read_audit_log(&tmp.path().join("none.jsonl")).unwrap().is_empty());
    }
}
