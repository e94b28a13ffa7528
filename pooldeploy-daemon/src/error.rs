use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime, coordinator, and control protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] pooldeploy_core::ConfigError),

    #[error("pool controller error: {0}")]
    Pool(#[from] PoolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("unknown application '{0}'")]
    UnknownApplication(String),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

/// Failures talking to the pool controller.
///
/// Ordinary start/stop timeouts are not errors; controllers report them as
/// `Ok(false)`.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("access denied controlling pool '{pool}': {message}")]
    AccessDenied { pool: String, message: String },

    #[error("pool '{0}' does not exist")]
    NotFound(String),

    #[error("pool command template '{0}' is empty")]
    EmptyCommand(&'static str),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
