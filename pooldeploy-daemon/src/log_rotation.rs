//! Size-based rotation for the daemon log and the deployment audit log.
//!
//! A file past the size limit is shifted to `<name>.1`, older copies move up
//! by one, and anything beyond `<name>.<MAX_ROTATED_FILES>` is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` when it has reached `max_bytes`. Returns whether it did.
///
/// A missing file is not an error. The live path is recreated empty so
/// writers that reopen it in append mode keep working.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes || max_files == 0 {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let from = numbered_path(log_path, n);
        if from.exists() {
            fs::rename(&from, numbered_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, numbered_path(log_path, 1))?;
    fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;
    Ok(true)
}

/// Rotate every file the daemon appends to under `home`. A failure on one
/// file is logged and does not stop the others.
pub fn rotate_logs(home: &Path) {
    let targets = [
        crate::paths::daemon_log_path(home),
        crate::paths::audit_log_path(home),
    ];
    for path in &targets {
        match rotate_if_needed(path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => tracing::info!(path = %path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "log rotation failed")
            }
        }
    }
}

/// `daemon.log` → `daemon.log.<n>`.
pub fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "daemon.log".to_string());
    base.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LIMIT: u64 = 64;

    fn oversized(path: &Path, fill: u8) {
        fs::write(path, vec![fill; LIMIT as usize + 1]).unwrap();
    }

    #[test]
    fn small_or_missing_files_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        assert!(!rotate_if_needed(&log, LIMIT, 5).unwrap());

        fs::write(&log, b"short").unwrap();
        assert!(!rotate_if_needed(&log, LIMIT, 5).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn oversized_file_moves_to_first_copy() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("deployments.jsonl");
        oversized(&log, b'a');

        assert!(rotate_if_needed(&log, LIMIT, 5).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(
            fs::metadata(numbered_path(&log, 1)).unwrap().len(),
            LIMIT + 1
        );
    }

    #[test]
    fn copies_shift_and_are_capped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");

        for round in 0..4u8 {
            oversized(&log, b'0' + round);
            rotate_if_needed(&log, LIMIT, 3).unwrap();
        }

        // Newest copy first; the first round fell off the end.
        assert_eq!(fs::read(numbered_path(&log, 1)).unwrap()[0], b'3');
        assert_eq!(fs::read(numbered_path(&log, 3)).unwrap()[0], b'1');
        assert!(!numbered_path(&log, 4).exists());
    }

    #[test]
    fn rotate_logs_covers_daemon_and_audit_files() {
        let home = TempDir::new().unwrap();
        let daemon_log = crate::paths::daemon_log_path(home.path());
        let audit_log = crate::paths::audit_log_path(home.path());
        for path in [&daemon_log, &audit_log] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"tiny").unwrap();
        }
        // Under the real limit: nothing happens, nothing panics.
        rotate_logs(home.path());
        assert!(!numbered_path(&daemon_log, 1).exists());
        assert!(!numbered_path(&audit_log, 1).exists());
    }
}
