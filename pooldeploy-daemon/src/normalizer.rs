//! Raw filesystem notifications → [`ChangeRecord`]s.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use pooldeploy_core::{ChangeKind, ChangeRecord, ExcludeSet};
use pooldeploy_sync::digest::file_digest;

use crate::pending::PendingChangeSet;

/// A notification reduced to the parts the normalizer cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub old_path: Option<PathBuf>,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            old_path: None,
        }
    }

    pub fn renamed(old_path: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Renamed,
            old_path: Some(old_path.into()),
        }
    }

    /// Translate one `notify` event. Access and unclassified events yield nothing.
    pub fn from_notify(event: &Event) -> Vec<RawEvent> {
        let simple = |kind: ChangeKind| {
            event
                .paths
                .iter()
                .map(|p| RawEvent::new(p.clone(), kind))
                .collect::<Vec<_>>()
        };

        match &event.kind {
            EventKind::Create(_) => simple(ChangeKind::Created),
            EventKind::Remove(_) => simple(ChangeKind::Deleted),
            EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
                (RenameMode::Both, [from, to]) => vec![RawEvent::renamed(from.clone(), to.clone())],
                (RenameMode::From, _) => simple(ChangeKind::Deleted),
                _ => event
                    .paths
                    .iter()
                    .map(|p| {
                        // Half of a rename pair; whether the path still exists
                        // tells which half we got.
                        let kind = if p.exists() {
                            ChangeKind::Renamed
                        } else {
                            ChangeKind::Deleted
                        };
                        RawEvent::new(p.clone(), kind)
                    })
                    .collect(),
            },
            EventKind::Modify(_) => simple(ChangeKind::Modified),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        }
    }
}

/// Applies exclusion patterns and fingerprints files.
#[derive(Debug, Clone, Default)]
pub struct ChangeNormalizer {
    exclude: ExcludeSet,
}

impl ChangeNormalizer {
    pub fn new(exclude: ExcludeSet) -> Self {
        Self { exclude }
    }

    /// Produce a record for `raw`, or `None` when the event should be dropped.
    ///
    /// Blocking: reads the file to hash it. A file that cannot be read (already
    /// gone, locked) still yields a record, with `size = 0` and no hash.
    pub fn normalize(&self, raw: RawEvent) -> Option<ChangeRecord> {
        if self.exclude.is_excluded(&raw.path) {
            // Renaming a tracked file to an excluded name removes it from view.
            return match raw.old_path {
                Some(old) if raw.kind == ChangeKind::Renamed && !self.exclude.is_excluded(&old) => {
                    Some(ChangeRecord::new(old, ChangeKind::Deleted))
                }
                _ => None,
            };
        }
        if raw.kind != ChangeKind::Deleted && raw.path.is_dir() {
            return None;
        }

        let mut record = ChangeRecord::new(raw.path, raw.kind);
        if raw.kind == ChangeKind::Renamed {
            record.old_path = raw
                .old_path
                .filter(|old| !self.exclude.is_excluded(old));
        }
        if raw.kind != ChangeKind::Deleted {
            fingerprint(&mut record);
        }
        Some(record)
    }

    /// Normalize and insert into `pending`. Returns whether a record was stored.
    pub fn ingest(&self, raw: RawEvent, pending: &PendingChangeSet) -> bool {
        match self.normalize(raw) {
            Some(record) => {
                pending.insert(record);
                true
            }
            None => false,
        }
    }
}

fn fingerprint(record: &mut ChangeRecord) {
    match file_digest(Path::new(&record.path)) {
        Ok(digest) => {
            record.size = digest.size;
            record.content_hash = Some(digest.sha256);
        }
        Err(err) => {
            tracing::debug!(path = %record.path.display(), error = %err, "could not fingerprint changed file");
        }
    }
}
