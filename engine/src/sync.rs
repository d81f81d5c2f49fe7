//! Copy/sync engine: materializes a change set into a reserved snapshot.
//!
//! Directories are created up front, then files are copied or hard-linked on
//! a bounded rayon pool. The first failing entry aborts the whole run.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::checksums;
use crate::detect::ChangeSet;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{BackupMode, BackupOptions, LinkPolicy, SourceEntry};
use crate::progress::ProgressCallback;

/// How a single file ended up in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Fresh content written
    Copied { bytes: u64 },
    /// Hard link to the reference snapshot's copy
    Linked,
    /// Hard link refused (e.g. across filesystems); copied instead
    LinkFallback { bytes: u64 },
}

#[derive(Debug, Clone)]
pub struct MaterializedEntry {
    pub rel_path: PathBuf,
    pub outcome: EntryOutcome,
    /// True for files kept only because they were in the reference snapshot
    pub carried_forward: bool,
}

/// Totals for one materialization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub directories_created: usize,
    pub files_copied: usize,
    pub files_linked: usize,
    pub link_fallbacks: usize,
    pub files_carried_forward: usize,
    /// Reference entries left out of a mirror snapshot
    pub entries_removed: usize,
    pub bytes_written: u64,
}

impl SyncReport {
    fn record(&mut self, entry: &MaterializedEntry) {
        match entry.outcome {
            EntryOutcome::Copied { bytes } => {
                self.files_copied += 1;
                self.bytes_written += bytes;
            }
            EntryOutcome::Linked => self.files_linked += 1,
            EntryOutcome::LinkFallback { bytes } => {
                self.link_fallbacks += 1;
                self.bytes_written += bytes;
            }
        }
        if entry.carried_forward {
            self.files_carried_forward += 1;
        }
    }
}

enum Task<'a> {
    /// New or modified source file
    Copy(&'a SourceEntry),
    /// Unchanged source file with a twin in the reference snapshot
    Link {
        entry: &'a SourceEntry,
        reference_path: &'a Path,
    },
    /// Reference-only file kept by an incremental run
    CarryForward(&'a SourceEntry),
}

/// Populate `snapshot_dir` from the change set.
///
/// `mode` is the effective mode: incremental carries reference-only entries
/// forward, mirror leaves them out, full has none.
pub fn materialize(
    snapshot_dir: &Path,
    mode: BackupMode,
    changes: &ChangeSet,
    options: &BackupOptions,
    progress: Option<&dyn ProgressCallback>,
) -> Result<SyncReport, EngineError> {
    let mut report = SyncReport::default();

    let carry_forward = mode == BackupMode::Incremental;
    let (kept_dirs, kept_files): (Vec<&SourceEntry>, Vec<&SourceEntry>) = if carry_forward {
        changes.reference_only.iter().partition(|e| e.is_dir())
    } else {
        (Vec::new(), Vec::new())
    };
    if mode == BackupMode::Mirror {
        report.entries_removed = changes.reference_only.len();
    }

    let directories: Vec<&SourceEntry> = changes.directories.iter().chain(kept_dirs).collect();
    for dir in &directories {
        fs_ops::ensure_dir_exists(&snapshot_dir.join(&dir.rel_path))?;
        report.directories_created += 1;
    }

    let tasks: Vec<Task<'_>> = changes
        .to_copy()
        .map(Task::Copy)
        .chain(changes.unchanged.iter().map(|u| Task::Link {
            entry: &u.entry,
            reference_path: &u.reference_path,
        }))
        .chain(kept_files.into_iter().map(Task::CarryForward))
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.max(1))
        .thread_name(|i| format!("snapshot-copy-{}", i))
        .build()
        .map_err(|e| EngineError::InvalidState {
            message: format!("failed to start copy workers: {}", e),
        })?;

    let done: Vec<MaterializedEntry> = pool.install(|| {
        tasks
            .par_iter()
            .map(|task| -> Result<MaterializedEntry, EngineError> {
                let entry = run_task(task, snapshot_dir, options)?;
                if let Some(callback) = progress {
                    callback.on_entry_completed(&entry);
                }
                Ok(entry)
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    for entry in &done {
        report.record(entry);
    }

    // Deepest first, so a read-only parent never blocks its children
    for dir in directories.iter().rev() {
        fs_ops::copy_dir_metadata(dir, &snapshot_dir.join(&dir.rel_path));
    }

    debug!(?report, "snapshot materialized");
    Ok(report)
}

fn run_task(
    task: &Task<'_>,
    snapshot_dir: &Path,
    options: &BackupOptions,
) -> Result<MaterializedEntry, EngineError> {
    match *task {
        Task::Copy(entry) => {
            let bytes = copy_verified(&entry.path, &snapshot_dir.join(&entry.rel_path), options)?;
            Ok(MaterializedEntry {
                rel_path: entry.rel_path.clone(),
                outcome: EntryOutcome::Copied { bytes },
                carried_forward: false,
            })
        }
        Task::Link {
            entry,
            reference_path,
        } => {
            // The source file is identical to the reference, so it is the
            // fallback copy's origin; its signature is not recomputed
            let outcome = link_or_copy(
                reference_path,
                &entry.path,
                &snapshot_dir.join(&entry.rel_path),
                options,
            )?;
            Ok(MaterializedEntry {
                rel_path: entry.rel_path.clone(),
                outcome,
                carried_forward: false,
            })
        }
        Task::CarryForward(entry) => {
            let outcome = link_or_copy(
                &entry.path,
                &entry.path,
                &snapshot_dir.join(&entry.rel_path),
                options,
            )?;
            Ok(MaterializedEntry {
                rel_path: entry.rel_path.clone(),
                outcome,
                carried_forward: true,
            })
        }
    }
}

fn link_or_copy(
    link_target: &Path,
    copy_origin: &Path,
    dst: &Path,
    options: &BackupOptions,
) -> Result<EntryOutcome, EngineError> {
    match options.link_policy {
        LinkPolicy::Copy => Ok(EntryOutcome::Copied {
            bytes: copy_verified(copy_origin, dst, options)?,
        }),
        LinkPolicy::HardLink => match fs_ops::hard_link(link_target, dst) {
            Ok(()) => Ok(EntryOutcome::Linked),
            Err(e) => {
                warn!(
                    link_target = %link_target.display(),
                    error = %e,
                    "hard link failed, copying instead"
                );
                Ok(EntryOutcome::LinkFallback {
                    bytes: copy_verified(copy_origin, dst, options)?,
                })
            }
        },
    }
}

fn copy_verified(src: &Path, dst: &Path, options: &BackupOptions) -> Result<u64, EngineError> {
    let bytes = fs_ops::copy_file_with_metadata(src, dst)?;
    if let Some(algorithm) = options.verify_after_copy {
        checksums::verify_copy(src, dst, algorithm)?;
    }
    Ok(bytes)
}
