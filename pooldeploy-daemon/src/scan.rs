//! Directory walks used by the watcher setup and by manual triggers.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use pooldeploy_core::{ChangeKind, ChangeRecord, ExcludeSet};

use crate::error::{io_err, DaemonError};
use crate::normalizer::{ChangeNormalizer, RawEvent};

/// Every directory under `root`, `root` included, breadth first and sorted.
/// A root that does not exist yields nothing.
pub fn collect_dirs(root: &Path) -> Result<Vec<PathBuf>, DaemonError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

/// Synthesize `Modified` records for files under `roots` changed at or after
/// `since` (every file when `None`).
///
/// Records pass through `normalizer` (global excludes, fingerprint) and then
/// `exclude` (the application's own patterns). Blocking.
pub fn rescan(
    roots: &[PathBuf],
    since: Option<SystemTime>,
    normalizer: &ChangeNormalizer,
    exclude: &ExcludeSet,
) -> Result<Vec<ChangeRecord>, DaemonError> {
    let mut records = Vec::new();
    for root in roots {
        for dir in collect_dirs(root)? {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&dir, err)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| io_err(&dir, e))?;
                let path = entry.path();
                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    // Deleted between listing and stat.
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(io_err(&path, err)),
                };
                if !metadata.is_file() || exclude.is_excluded(&path) {
                    continue;
                }
                if let Some(since) = since {
                    let modified = metadata.modified().map_err(|e| io_err(&path, e))?;
                    if modified < since {
                        continue;
                    }
                }
                if let Some(record) = normalizer.normalize(RawEvent::new(path, ChangeKind::Modified)) {
                    records.push(record);
                }
            }
        }
    }
    records.sort_by(|a, b| a.path.cmp(&b.path));
    records.dedup_by(|a, b| a.path == b.path);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn collect_dirs_walks_nested_tree() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::create_dir_all(tmp.path().join("c")).unwrap();
        fs::write(tmp.path().join("a/file.txt"), b"x").unwrap();

        let dirs = collect_dirs(tmp.path()).unwrap();
        assert_eq!(dirs.len(), 4);
        assert!(dirs.contains(&tmp.path().join("a/b")));
        assert!(collect_dirs(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn rescan_honours_since_and_excludes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("app");
        fs::create_dir_all(root.join("bin")).unwrap();
        let fresh = root.join("bin/app.dll");
        let stale = root.join("old.cfg");
        let noise = root.join("debug.log");
        let swap = root.join("edit.swp");
        for path in [&fresh, &stale, &noise, &swap] {
            fs::write(path, b"data").unwrap();
        }
        let hour_ago = SystemTime::now() - Duration::from_secs(3_600);
        set_file_mtime(&stale, FileTime::from_system_time(hour_ago)).unwrap();

        let normalizer = ChangeNormalizer::new(ExcludeSet::new(["*.swp"]));
        let exclude = ExcludeSet::new(["*.log"]);
        let since = Some(SystemTime::now() - Duration::from_secs(600));

        let records = rescan(&[root.clone()], since, &normalizer, &exclude).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, fresh);
        assert_eq!(records[0].kind, ChangeKind::Modified);
        assert_eq!(records[0].size, 4);

        let everything = rescan(&[root], None, &normalizer, &exclude).unwrap();
        assert_eq!(everything.len(), 2);
    }
}
