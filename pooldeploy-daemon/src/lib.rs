//! The pooldeploy daemon: watches application source trees, batches changes
//! on a fixed interval and redeploys each affected application by stopping
//! its pool, copying the changed files and starting the pool again.
//!
//! Data flows watcher → [`normalizer`] → [`pending`] → [`router`] →
//! [`coordinator`] → [`executor`], with every finished operation handed to an
//! [`audit`] sink. The runtime wires the pieces to a real filesystem watcher
//! and the control socket spoken by [`protocol`].

pub mod audit;
pub mod coordinator;
mod error;
pub mod executor;
pub mod health;
pub mod log_rotation;
pub mod normalizer;
pub mod paths;
pub mod pending;
pub mod pool;
pub mod protocol;
pub mod router;
mod runtime;
pub mod scan;

pub use audit::{
    read_audit_log, AuditSink, FanoutAuditSink, JsonlAuditSink, MemoryAuditSink, TracingAuditSink,
};
pub use coordinator::{Admission, DeploymentCoordinator, LastDeployment, SkipReason};
pub use error::{DaemonError, PoolError};
pub use executor::{LiveOperation, StepExecutor};
pub use normalizer::{ChangeNormalizer, RawEvent};
pub use pending::{FlushScheduler, PendingChangeSet};
pub use pool::{CommandPoolController, MemoryPoolController, PoolCall, PoolController};
pub use protocol::{
    request_status, request_stop, request_trigger, send_request, DaemonRequest, DaemonResponse,
};
pub use router::ApplicationRouter;
pub use runtime::{run, run_with, start_blocking, RunOptions};
