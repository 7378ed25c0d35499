//! Retention of local archives and remote files.
//!
//! Local and remote policies run in the same pass but share no state.
//!
//! - **Local**: keep the `keep_local` newest archives (by modification
//!   time) in the archive directory and delete the rest. Each deletion is
//!   independent; one failure does not stop the others.
//! - **Remote**: when the listing holds more than `keep_remote` files,
//!   delete the single oldest one. Exactly one per run, never draining to
//!   the threshold, so a runaway schedule cannot wipe remote history.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveNaming;
use crate::remote::{RemoteFile, RemoteStore};

/// How many artifacts survive on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_local: usize,
    pub keep_remote: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_local: 3,
            keep_remote: 7,
        }
    }
}

/// An archive found in the archive directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArchive {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: SystemTime,
}

/// List archives matching `naming`, newest first.
///
/// A missing directory holds no archives.
pub fn list_local_archives(dir: &Path, naming: &ArchiveNaming) -> std::io::Result<Vec<LocalArchive>> {
    let pattern = naming
        .pattern()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut archives = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !pattern.matches(&file_name) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping unreadable archive");
                continue;
            }
        };
        archives.push(LocalArchive {
            path: entry.path(),
            file_name,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    sort_newest_first(&mut archives);
    Ok(archives)
}

fn sort_newest_first(archives: &mut [LocalArchive]) {
    archives.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.file_name.cmp(&a.file_name))
    });
}

/// Archives beyond the newest `keep`, given a newest-first list.
pub fn select_local_excess(archives: &[LocalArchive], keep: usize) -> &[LocalArchive] {
    archives.get(keep..).unwrap_or(&[])
}

/// The file remote retention would delete, if any.
///
/// Only files with a known upload time are candidates; ties are broken by
/// key so the choice is stable.
pub fn select_remote_victim(files: &[RemoteFile], keep: usize) -> Option<&RemoteFile> {
    if files.len() <= keep {
        return None;
    }
    files
        .iter()
        .filter_map(|f| f.uploaded_at.map(|at| (at, f)))
        .min_by(|(a_at, a), (b_at, b)| a_at.cmp(b_at).then_with(|| a.key.cmp(&b.key)))
        .map(|(_, f)| f)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalRetentionReport {
    pub found: usize,
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Set when the archive directory could not be listed.
    pub listing_error: Option<String>,
}

/// Delete each of `archives`, recording successes and failures in `report`.
/// A failed deletion does not stop the rest.
pub fn delete_local_archives(archives: &[LocalArchive], report: &mut LocalRetentionReport) {
    for archive in archives {
        match std::fs::remove_file(&archive.path) {
            Ok(()) => {
                info!(archive = %archive.file_name, "deleted old local archive");
                report.deleted.push(archive.path.clone());
            }
            Err(e) => {
                error!(archive = %archive.path.display(), error = %e, "failed to delete local archive");
                report.failed.push((archive.path.clone(), e.to_string()));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRetentionOutcome {
    /// At or below the threshold; nothing to do.
    WithinWindow { count: usize },
    /// Over the threshold but no file has a known upload time.
    NoCandidate { count: usize },
    Deleted { key: String, name: String, count: usize },
    /// The store answered but did not confirm the deletion.
    NotConfirmed {
        key: String,
        success: bool,
        deleted_count: u64,
    },
    DeleteFailed { key: String, error: String },
    ListFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub local: LocalRetentionReport,
    pub remote: Option<RemoteRetentionOutcome>,
}

/// Applies a [`RetentionPolicy`] to one archive directory and, optionally,
/// one remote store.
pub struct RetentionEngine<'a, S: RemoteStore + ?Sized> {
    policy: RetentionPolicy,
    archive_dir: PathBuf,
    naming: ArchiveNaming,
    store: Option<&'a S>,
}

impl<'a, S: RemoteStore + ?Sized> RetentionEngine<'a, S> {
    pub fn new(policy: RetentionPolicy, archive_dir: impl Into<PathBuf>, naming: ArchiveNaming) -> Self {
        Self {
            policy,
            archive_dir: archive_dir.into(),
            naming,
            store: None,
        }
    }

    /// Also enforce remote retention against `store`.
    pub fn with_remote(mut self, store: &'a S) -> Self {
        self.store = Some(store);
        self
    }

    /// Run both policies.
    pub fn run(&self) -> RetentionReport {
        let local = self.enforce_local();
        let remote = self.store.map(|store| self.enforce_remote(store));
        RetentionReport { local, remote }
    }

    pub fn enforce_local(&self) -> LocalRetentionReport {
        let mut report = LocalRetentionReport::default();

        let archives = match list_local_archives(&self.archive_dir, &self.naming) {
            Ok(archives) => archives,
            Err(e) => {
                error!(dir = %self.archive_dir.display(), error = %e, "cannot list local archives");
                report.listing_error = Some(e.to_string());
                return report;
            }
        };

        report.found = archives.len();
        let excess = select_local_excess(&archives, self.policy.keep_local);
        report.kept = archives.len() - excess.len();

        if excess.is_empty() {
            info!(
                found = archives.len(),
                keep = self.policy.keep_local,
                "local retention: nothing to delete"
            );
            return report;
        }

        delete_local_archives(excess, &mut report);

        info!(
            kept = report.kept,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "local retention finished"
        );
        report
    }

    pub fn enforce_remote(&self, store: &S) -> RemoteRetentionOutcome {
        let files = match store.list_files() {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "cannot list remote files; skipping remote retention");
                return RemoteRetentionOutcome::ListFailed {
                    error: e.to_string(),
                };
            }
        };
        let count = files.len();

        if count <= self.policy.keep_remote {
            info!(count, keep = self.policy.keep_remote, "remote retention: nothing to delete");
            return RemoteRetentionOutcome::WithinWindow { count };
        }

        let Some(victim) = select_remote_victim(&files, self.policy.keep_remote) else {
            warn!(count, "remote files exceed the window but none reports an upload time");
            return RemoteRetentionOutcome::NoCandidate { count };
        };
        debug!(key = %victim.key, uploaded_at = ?victim.uploaded_at, "oldest remote file selected");

        let keys = vec![victim.key.clone()];
        match store.delete_files(&keys) {
            Ok(result) if result.is_confirmed() => {
                info!(
                    key = %victim.key,
                    name = %victim.name,
                    remaining = count - 1,
                    "deleted oldest remote file"
                );
                RemoteRetentionOutcome::Deleted {
                    key: victim.key.clone(),
                    name: victim.name.clone(),
                    count,
                }
            }
            Ok(result) => {
                error!(
                    key = %victim.key,
                    success = result.success,
                    deleted_count = result.deleted_count,
                    "remote store did not confirm deletion; will retry next run"
                );
                RemoteRetentionOutcome::NotConfirmed {
                    key: victim.key.clone(),
                    success: result.success,
                    deleted_count: result.deleted_count,
                }
            }
            Err(e) => {
                error!(key = %victim.key, error = %e, "remote deletion failed; will retry next run");
                RemoteRetentionOutcome::DeleteFailed {
                    key: victim.key.clone(),
                    error: e.to_string(),
                }
            }
        }
    }
}
