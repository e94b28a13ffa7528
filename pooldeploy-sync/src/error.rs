//! Error types for pooldeploy-sync.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from file transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every attempt failed; `source` is the error from the last one.
    #[error("gave up on {path} after {attempts} attempt(s): {source}")]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The caller stopped waiting; nothing further was written.
    #[error("cancelled {path} after {attempts} attempt(s)")]
    Cancelled { path: PathBuf, attempts: u32 },
}

impl TransferError {
    /// Number of attempts made before this error was returned.
    pub fn attempts(&self) -> u32 {
        match self {
            TransferError::Io { .. } => 1,
            TransferError::Exhausted { attempts, .. } => *attempts,
            TransferError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Convenience constructor for [`TransferError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.into(),
        source,
    }
}
