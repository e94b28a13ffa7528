//! Retrying copy / delete primitives.
//!
//! ## `copy` — per-attempt protocol
//!
//! 1. Create the destination's parent directories.
//! 2. Open the source with shared read access (writers may still hold it).
//! 3. Stream into `<destination>.pooldeploy.tmp`, opened exclusively.
//! 4. Rename the temporary file over the destination, unless the transfer
//!    has been cancelled in the meantime.
//!
//! A failed attempt removes its temporary file, sleeps for the policy delay
//! and tries again, up to `max_attempts` attempts in total. A cancelled
//! transfer makes no further attempts and never publishes its temporary file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pooldeploy_core::types::{FileAction, FileOutcome};

use crate::error::TransferError;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Shared stop signal for in-progress transfers.
///
/// Blocking transfers cannot be aborted from outside, so they poll this
/// between attempts and before publishing a copied file.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A successful value plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `op` until it succeeds, the policy is exhausted or `cancel` is set.
///
/// `op` receives the 1-based attempt number. Blocking: the delay is a
/// thread sleep, so call this from blocking contexts only.
pub fn retry<T, F>(
    policy: &RetryPolicy,
    path: &Path,
    cancel: &CancelFlag,
    mut op: F,
) -> Result<Attempted<T>, TransferError>
where
    F: FnMut(u32) -> io::Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(path, attempt - 1));
        }
        match op(attempt) {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                })
            }
            Err(err) if cancel.is_cancelled() => {
                tracing::debug!("attempt {attempt} for {} cancelled: {err}", path.display());
                return Err(cancelled(path, attempt));
            }
            Err(err) if attempt < max_attempts => {
                tracing::debug!(
                    "attempt {attempt}/{max_attempts} failed for {}: {err}",
                    path.display()
                );
                if !policy.delay.is_zero() {
                    std::thread::sleep(policy.delay);
                }
                attempt += 1;
            }
            Err(err) => {
                tracing::warn!(
                    "giving up on {} after {attempt} attempt(s): {err}",
                    path.display()
                );
                return Err(TransferError::Exhausted {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source: err,
                });
            }
        }
    }
}

fn cancelled(path: &Path, attempts: u32) -> TransferError {
    tracing::info!("cancelled transfer of {}", path.display());
    TransferError::Cancelled {
        path: path.to_path_buf(),
        attempts,
    }
}

// ---------------------------------------------------------------------------
// Transfer seam
// ---------------------------------------------------------------------------

/// File operations used by the copy step.
///
/// Implementations never fail the caller: every outcome, good or bad, is
/// reported as a [`FileOutcome`] so sibling files are unaffected. Once
/// `cancel` is set an implementation must not write to the destination.
pub trait FileTransfer: Send + Sync {
    fn copy(
        &self,
        source: &Path,
        destination: &Path,
        policy: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> FileOutcome;
    fn delete(&self, destination: &Path, policy: &RetryPolicy, cancel: &CancelFlag)
        -> FileOutcome;
}

/// Filesystem-backed [`FileTransfer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingTransfer;

impl RetryingTransfer {
    /// Copy with retry; returns the number of bytes written.
    pub fn copy_file(
        &self,
        source: &Path,
        destination: &Path,
        policy: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> Result<Attempted<u64>, TransferError> {
        retry(policy, destination, cancel, |_| {
            copy_once(source, destination, cancel)
        })
    }

    /// Delete with retry. A destination that is already gone counts as deleted.
    pub fn delete_file(
        &self,
        destination: &Path,
        policy: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> Result<Attempted<()>, TransferError> {
        retry(policy, destination, cancel, |_| delete_once(destination))
    }
}

impl FileTransfer for RetryingTransfer {
    fn copy(
        &self,
        source: &Path,
        destination: &Path,
        policy: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> FileOutcome {
        let result = self.copy_file(source, destination, policy, cancel);
        if let Ok(done) = &result {
            tracing::info!(
                "copied {} -> {} ({} bytes)",
                source.display(),
                destination.display(),
                done.value
            );
        }
        outcome(
            FileAction::Copy,
            Some(source),
            destination,
            result.map(|a| a.attempts),
        )
    }

    fn delete(
        &self,
        destination: &Path,
        policy: &RetryPolicy,
        cancel: &CancelFlag,
    ) -> FileOutcome {
        let result = self.delete_file(destination, policy, cancel);
        if result.is_ok() {
            tracing::info!("deleted {}", destination.display());
        }
        outcome(
            FileAction::Delete,
            None,
            destination,
            result.map(|a| a.attempts),
        )
    }
}

/// Build a [`FileOutcome`] from an attempt count or the final error.
pub fn outcome(
    action: FileAction,
    source: Option<&Path>,
    destination: &Path,
    result: Result<u32, TransferError>,
) -> FileOutcome {
    let (attempts, success, error) = match result {
        Ok(attempts) => (attempts, true, None),
        Err(err) => (err.attempts(), false, Some(err.to_string())),
    };
    FileOutcome {
        action,
        source: source.map(Path::to_path_buf),
        destination: destination.to_path_buf(),
        attempts,
        success,
        error,
    }
}

// ---------------------------------------------------------------------------
// Single attempts
// ---------------------------------------------------------------------------

fn copy_once(source: &Path, destination: &Path, cancel: &CancelFlag) -> io::Result<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut reader = open_shared(source)?;
    let tmp = tmp_path_for(destination);
    let written = open_exclusive(&tmp).and_then(|mut writer| {
        let written = io::copy(&mut reader, &mut writer)?;
        writer.sync_all()?;
        Ok(written)
    });
    // Close the source before renaming; some platforms refuse otherwise.
    drop(reader);

    let result = written.and_then(|n| {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"));
        }
        fs::rename(&tmp, destination).map(|()| n)
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn delete_once(destination: &Path) -> io::Result<()> {
    let removed = match fs::symlink_metadata(destination) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(destination),
        Ok(_) => fs::remove_file(destination),
        Err(err) => Err(err),
    };
    match removed {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn tmp_path_for(destination: &Path) -> PathBuf {
    PathBuf::from(format!("{}.pooldeploy.tmp", destination.display()))
}

/// Open for reading while letting other processes keep reading, writing or
/// deleting the file.
pub(crate) fn open_shared(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        options.share_mode(0x1 | 0x2 | 0x4);
    }
    options.open(path)
}

fn open_exclusive(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(0);
    }
    options.open(path)
}
