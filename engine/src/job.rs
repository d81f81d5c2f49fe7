//! Job orchestration module.
//!
//! This module provides the backup lifecycle functions:
//! - Creating a job from source/destination paths and validated options
//! - Planning a job (reference lookup, source scan, change detection)
//! - Running a job (reserve snapshot, materialize, compress, commit)

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compress::{self, Compression};
use crate::detect::{self, ChangeSet};
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{BackupJob, BackupMode, BackupOptions, JobState};
use crate::namer::{self, ReservedSnapshot};
use crate::progress::ProgressCallback;
use crate::sync::{self, SyncReport};

/// Outcome of a completed backup run.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub snapshot_name: String,
    /// Final artifact: the snapshot directory, or the archive replacing it
    pub snapshot_path: PathBuf,
    pub requested_mode: BackupMode,
    /// Mode actually applied (full when no reference was available)
    pub effective_mode: BackupMode,
    /// Name of the snapshot compared against, if any
    pub reference: Option<String>,
    pub compression: Option<Compression>,
    pub sync: SyncReport,
    pub skipped_entries: usize,
    pub elapsed: Duration,
}

/// Create a new backup job.
///
/// Validates that the source path exists and is a readable directory and that
/// the destination root does not live inside the source tree.
///
/// # Errors
/// `SourceNotFound`, `SourceUnreadable` or `InvalidPath`
pub fn create_job<P: AsRef<Path>, Q: AsRef<Path>>(
    source: P,
    destination_root: Q,
    options: BackupOptions,
) -> Result<BackupJob, EngineError> {
    let source = source.as_ref();
    let destination_root = destination_root.as_ref();

    match std::fs::metadata(source) {
        Ok(metadata) => {
            if !metadata.is_dir() {
                return Err(EngineError::InvalidPath {
                    path: source.to_path_buf(),
                    reason: "Source must be a directory".to_string(),
                });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: source.to_path_buf(),
            });
        }
        Err(e) => {
            return Err(EngineError::SourceUnreadable {
                path: source.to_path_buf(),
                source: e,
            });
        }
    }

    if destination_root.as_os_str().is_empty() {
        return Err(EngineError::InvalidPath {
            path: destination_root.to_path_buf(),
            reason: "Destination path is empty".to_string(),
        });
    }

    // Snapshots inside the source would be backed up by the next run. The
    // destination usually does not exist yet on the first run.
    let source_real = source
        .canonicalize()
        .map_err(|e| EngineError::SourceUnreadable {
            path: source.to_path_buf(),
            source: e,
        })?;
    let destination_real =
        fs_ops::resolve_path(destination_root).map_err(|e| EngineError::InvalidPath {
            path: destination_root.to_path_buf(),
            reason: format!("Destination cannot be resolved: {}", e),
        })?;
    if destination_real.starts_with(&source_real) {
        return Err(EngineError::InvalidPath {
            path: destination_root.to_path_buf(),
            reason: "Destination must not be inside the source directory".to_string(),
        });
    }

    Ok(BackupJob {
        id: Uuid::new_v4(),
        source_path: source.to_path_buf(),
        destination_root: destination_root.to_path_buf(),
        options,
        reference: None,
        changes: None,
        skipped: Vec::new(),
        state: JobState::Pending,
        created_at: SystemTime::now(),
        start_time: None,
        end_time: None,
    })
}

/// Plan a job: locate the reference snapshot, scan the source and classify it.
///
/// Incremental and mirror runs with no usable reference (first run, or only
/// archives so far) fall back to a full backup. Nothing is written to the
/// destination during planning.
///
/// # Errors
/// Returns EngineError if the source root or the reference cannot be read
pub fn plan_job(job: &mut BackupJob) -> Result<(), EngineError> {
    if job.state != JobState::Pending {
        return Err(EngineError::InvalidState {
            message: format!(
                "Job must be in Pending state to plan; current state: {:?}",
                job.state
            ),
        });
    }

    job.reference = match job.options.mode {
        BackupMode::Full => None,
        mode => {
            let reference = namer::find_reference(&job.destination_root)?;
            if reference.is_none() {
                info!(%mode, "no reference snapshot found; running a full backup");
            }
            reference
        }
    };

    let scan = fs_ops::enumerate_tree(&job.source_path)?;
    job.skipped = scan.skipped;

    let changes = match &job.reference {
        Some(reference) => {
            debug!(reference = %reference.name, "comparing against reference snapshot");
            let listing = detect::scan_reference(&reference.path)?;
            detect::detect_changes(scan.entries, &reference.path, listing, job.options.detection)
        }
        None => ChangeSet::all_new(scan.entries),
    };

    job.changes = Some(changes);
    job.state = JobState::Planned;
    Ok(())
}

/// Run a planned job, naming the snapshot after the current time.
pub fn run_job(
    job: &mut BackupJob,
    progress_callback: Option<&dyn ProgressCallback>,
) -> Result<BackupReport, EngineError> {
    run_job_at(job, Utc::now(), progress_callback)
}

/// Run a planned job, naming the snapshot after `now`.
///
/// The name is reserved here, after planning, rather than before the source
/// scan. A run that fails on configuration or source errors therefore leaves
/// nothing behind, at the cost of the name reflecting the end of planning
/// rather than the invocation time.
///
/// # Errors
/// `DirectoryExists` if a snapshot for this second already exists; copy and
/// compression errors otherwise. The job ends in `Failed` state on error.
pub fn run_job_at(
    job: &mut BackupJob,
    now: DateTime<Utc>,
    progress_callback: Option<&dyn ProgressCallback>,
) -> Result<BackupReport, EngineError> {
    if job.state != JobState::Planned {
        return Err(EngineError::InvalidState {
            message: format!(
                "Job must be in Planned state to run; current state: {:?}",
                job.state
            ),
        });
    }

    let result = execute(job, now, progress_callback);
    job.end_time = Some(SystemTime::now());
    match &result {
        Ok(report) => {
            job.state = JobState::Completed;
            if let Some(callback) = progress_callback {
                callback.on_backup_completed(job, report);
            }
        }
        Err(_) => job.state = JobState::Failed,
    }
    result
}

fn execute(
    job: &mut BackupJob,
    now: DateTime<Utc>,
    progress_callback: Option<&dyn ProgressCallback>,
) -> Result<BackupReport, EngineError> {
    let reserved = namer::reserve_snapshot(&job.destination_root, now)?;
    let snapshot_name = reserved.name.clone();

    job.state = JobState::Running;
    job.start_time = Some(SystemTime::now());
    let started = std::time::Instant::now();
    let effective_mode = job.effective_mode();

    info!(
        job = %job.id,
        snapshot = %snapshot_name,
        mode = %effective_mode,
        source = %job.source_path.display(),
        "backup started"
    );
    if let Some(callback) = progress_callback {
        callback.on_backup_started(job, &snapshot_name);
    }

    let changes = job.changes.as_ref().ok_or_else(|| EngineError::InvalidState {
        message: "Job has no change set".to_string(),
    })?;

    let sync_report = match sync::materialize(
        &reserved.path,
        effective_mode,
        changes,
        &job.options,
        progress_callback,
    ) {
        Ok(report) => report,
        Err(e) => {
            reserved.discard();
            return Err(e);
        }
    };

    let snapshot_path = match job.options.compression {
        Some(compression) => archive_snapshot(reserved, compression)?,
        None => reserved.commit()?,
    };

    let report = BackupReport {
        snapshot_name,
        snapshot_path,
        requested_mode: job.options.mode,
        effective_mode,
        reference: job.reference.as_ref().map(|r| r.name.clone()),
        compression: job.options.compression,
        sync: sync_report,
        skipped_entries: job.skipped.len(),
        elapsed: started.elapsed(),
    };

    info!(
        job = %job.id,
        snapshot = %report.snapshot_path.display(),
        copied = report.sync.files_copied,
        linked = report.sync.files_linked,
        bytes = report.sync.bytes_written,
        skipped = report.skipped_entries,
        "backup completed"
    );
    Ok(report)
}

/// Archive a fully populated snapshot, then settle its in-progress marker.
///
/// The marker is removed only once the directory is gone or, on compression
/// failure, once the intact directory is all that remains. Leftovers of a
/// directory that could not be fully removed stay flagged as partial.
fn archive_snapshot(
    reserved: ReservedSnapshot,
    compression: Compression,
) -> Result<PathBuf, EngineError> {
    match compress::compress_snapshot(&reserved.path, compression) {
        Ok(archive) => {
            settle_archived(reserved)?;
            Ok(archive)
        }
        Err(e) => {
            reserved.commit()?;
            Err(e)
        }
    }
}

fn settle_archived(reserved: ReservedSnapshot) -> Result<(), EngineError> {
    if reserved.path.exists() {
        warn!(
            snapshot = %reserved.path.display(),
            "leftover snapshot directory kept flagged as incomplete"
        );
        return Ok(());
    }
    reserved.commit()?;
    Ok(())
}

/// Create, plan and run a backup in one call.
pub fn run_backup<P: AsRef<Path>, Q: AsRef<Path>>(
    source: P,
    destination_root: Q,
    options: BackupOptions,
    progress_callback: Option<&dyn ProgressCallback>,
) -> Result<BackupReport, EngineError> {
    let mut job = create_job(source, destination_root, options)?;
    plan_job(&mut job)?;
    run_job(&mut job, progress_callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::ChecksumAlgorithm;
    use crate::compress::Level;
    use crate::model::ChangeDetection;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::fs;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn backup_at(
        src: &Path,
        dst: &Path,
        options: BackupOptions,
        secs: i64,
    ) -> Result<BackupReport, EngineError> {
        let mut job = create_job(src, dst, options)?;
        plan_job(&mut job)?;
        run_job_at(&mut job, at(secs), None)
    }

    /// Map of relative file path to content.
    fn contents(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fs_ops::enumerate_tree(root)
            .expect("Failed to scan tree")
            .entries
            .into_iter()
            .filter(|e| !e.is_dir())
            .map(|e| {
                let data = fs::read(&e.path).expect("Failed to read file");
                (e.rel_path, data)
            })
            .collect()
    }

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("test_data");
        let dst = temp_dir.path().join("backups");
        fs::create_dir(&src).expect("Failed to create src dir");
        fs::write(src.join("a.log"), vec![b'a'; 100]).expect("Failed to write a.log");
        fs::write(src.join("b.db"), vec![b'b'; 200]).expect("Failed to write b.db");
        (temp_dir, src, dst)
    }

    fn touch(path: &Path, secs: i64) {
        filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(secs, 0))
            .expect("Failed to set mtime");
    }

    #[test]
    fn test_create_job_with_valid_source() {
        let (_temp, src, dst) = setup();
        let job = create_job(&src, &dst, BackupOptions::new(BackupMode::Full))
            .expect("Failed to create job");
        assert_eq!(job.state, JobState::Pending);
        assert!(job.changes.is_none());
    }

    #[test]
    fn test_create_job_with_missing_source() {
        let (temp, _, dst) = setup();
        let result = create_job(
            temp.path().join("nope"),
            &dst,
            BackupOptions::new(BackupMode::Full),
        );
        assert!(matches!(result, Err(EngineError::SourceNotFound { .. })));
    }

    #[test]
    fn test_create_job_with_file_as_source() {
        let (_temp, src, dst) = setup();
        let result = create_job(src.join("a.log"), &dst, BackupOptions::new(BackupMode::Full));
        assert!(matches!(result, Err(EngineError::InvalidPath { .. })));
    }

    #[test]
    fn test_create_job_rejects_destination_inside_source() {
        let (_temp, src, _) = setup();
        let nested = src.join("backups");
        fs::create_dir(&nested).expect("mkdir");
        let result = create_job(&src, &nested, BackupOptions::new(BackupMode::Full));
        assert!(matches!(result, Err(EngineError::InvalidPath { .. })));
    }

    #[test]
    fn test_create_job_rejects_missing_destination_inside_source() {
        let (_temp, src, _) = setup();
        let nested = src.join("backups").join("daily");

        let result = create_job(&src, &nested, BackupOptions::new(BackupMode::Full));
        assert!(matches!(result, Err(EngineError::InvalidPath { .. })));
        assert!(!src.join("backups").exists(), "nothing may be created inside the source");
    }

    #[test]
    fn test_create_job_accepts_missing_destination_outside_source() {
        let (temp, src, _) = setup();
        let dst = temp.path().join("new").join("backups");

        let job = create_job(&src, &dst, BackupOptions::new(BackupMode::Full))
            .expect("A missing destination outside the source is fine");
        assert_eq!(job.destination_root, dst);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_source_root_fails_planning() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, src, dst) = setup();
        let job = create_job(&src, &dst, BackupOptions::new(BackupMode::Full));
        fs::set_permissions(&src, fs::Permissions::from_mode(0o000)).expect("chmod 000");
        if fs::read_dir(&src).is_ok() {
            // Privileged runs ignore permission bits
            fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }

        let result = job.and_then(|mut job| plan_job(&mut job));
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).expect("chmod");

        let err = result.unwrap_err();
        assert!(matches!(err, EngineError::SourceUnreadable { .. }));
        assert_eq!(err.exit_code(), 4);
        assert!(!dst.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_denied_entries_are_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, src, dst) = setup();
        fs::create_dir(src.join("locked")).expect("mkdir");
        fs::write(src.join("locked").join("c.doc"), b"c").expect("write");
        fs::set_permissions(src.join("a.log"), fs::Permissions::from_mode(0o000))
            .expect("chmod 000");
        fs::set_permissions(src.join("locked"), fs::Permissions::from_mode(0o000))
            .expect("chmod 000");
        let denied = fs::File::open(src.join("a.log")).is_err();

        let result = backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0);
        fs::set_permissions(src.join("locked"), fs::Permissions::from_mode(0o755))
            .expect("chmod");
        fs::set_permissions(src.join("a.log"), fs::Permissions::from_mode(0o644))
            .expect("chmod");
        if !denied {
            // Privileged runs ignore permission bits
            return;
        }

        let report = result.expect("Denied entries must not abort the run");
        assert_eq!(report.skipped_entries, 2);
        assert_eq!(report.sync.files_copied, 1);
        assert!(report.snapshot_path.join("b.db").is_file());
        assert!(!report.snapshot_path.join("a.log").exists());
        assert!(!report.snapshot_path.join("locked").exists());
    }

    #[test]
    fn test_plan_job_requires_pending_state() {
        let (_temp, src, dst) = setup();
        let mut job = create_job(&src, &dst, BackupOptions::new(BackupMode::Full))
            .expect("Failed to create job");
        plan_job(&mut job).expect("Failed to plan job");
        assert_eq!(job.state, JobState::Planned);
        assert!(matches!(
            plan_job(&mut job),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_run_job_requires_planned_state() {
        let (_temp, src, dst) = setup();
        let mut job = create_job(&src, &dst, BackupOptions::new(BackupMode::Full))
            .expect("Failed to create job");
        let result = run_job(&mut job, None);
        assert!(matches!(result, Err(EngineError::InvalidState { .. })));
        assert!(!dst.exists(), "nothing may be written before planning");
    }

    #[test]
    fn test_first_incremental_degrades_to_full() {
        let (_temp, src, dst) = setup();
        let report = backup_at(&src, &dst, BackupOptions::new(BackupMode::Incremental), 0)
            .expect("Failed to back up");

        assert_eq!(report.requested_mode, BackupMode::Incremental);
        assert_eq!(report.effective_mode, BackupMode::Full);
        assert!(report.reference.is_none());
        assert_eq!(report.sync.files_copied, 2);
        assert_eq!(contents(&report.snapshot_path), contents(&src));
    }

    #[test]
    fn test_full_incremental_mirror_walkthrough() {
        let (_temp, src, dst) = setup();

        let full = backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0)
            .expect("Full backup failed");
        assert_eq!(full.sync.bytes_written, 300);

        fs::write(src.join("a.log"), vec![b'A'; 100]).expect("write");
        touch(&src.join("a.log"), 1_800_000_000);
        let incremental = backup_at(&src, &dst, BackupOptions::new(BackupMode::Incremental), 1)
            .expect("Incremental backup failed");
        assert_eq!(incremental.reference.as_deref(), Some(full.snapshot_name.as_str()));
        assert_eq!(incremental.sync.files_copied, 1);
        assert_eq!(incremental.sync.bytes_written, 100);
        assert_eq!(contents(&incremental.snapshot_path), contents(&src));

        fs::remove_file(src.join("a.log")).expect("remove");
        let mirror = backup_at(&src, &dst, BackupOptions::new(BackupMode::Mirror), 2)
            .expect("Mirror backup failed");
        let mirrored = contents(&mirror.snapshot_path);
        assert_eq!(mirrored.keys().collect::<Vec<_>>(), vec![&PathBuf::from("b.db")]);
        assert_eq!(mirror.sync.entries_removed, 1);

        // Older snapshots are untouched
        assert_eq!(
            fs::read(full.snapshot_path.join("a.log")).expect("read"),
            vec![b'a'; 100]
        );
    }

    #[test]
    fn test_incremental_keeps_deleted_files() {
        let (_temp, src, dst) = setup();
        backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0).expect("Full failed");

        fs::remove_file(src.join("a.log")).expect("remove");
        let incremental = backup_at(&src, &dst, BackupOptions::new(BackupMode::Incremental), 1)
            .expect("Incremental failed");
        assert_eq!(
            fs::read(incremental.snapshot_path.join("a.log")).expect("read"),
            vec![b'a'; 100]
        );
        assert_eq!(incremental.sync.files_carried_forward, 1);

        let mirror = backup_at(&src, &dst, BackupOptions::new(BackupMode::Mirror), 2)
            .expect("Mirror failed");
        assert!(!mirror.snapshot_path.join("a.log").exists());
    }

    #[test]
    fn test_mirror_is_idempotent() {
        let (_temp, src, dst) = setup();
        fs::create_dir(src.join("nested")).expect("mkdir");
        fs::write(src.join("nested").join("c.xls"), b"cells").expect("write");

        let first = backup_at(&src, &dst, BackupOptions::new(BackupMode::Mirror), 0)
            .expect("First mirror failed");
        let second = backup_at(&src, &dst, BackupOptions::new(BackupMode::Mirror), 1)
            .expect("Second mirror failed");

        assert_ne!(first.snapshot_name, second.snapshot_name);
        assert_eq!(contents(&first.snapshot_path), contents(&second.snapshot_path));
        assert_eq!(second.sync.files_copied, 0);
    }

    #[test]
    fn test_same_second_collision_fails_and_keeps_winner() {
        let (_temp, src, dst) = setup();
        let first = backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0)
            .expect("First backup failed");

        let err = backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0).unwrap_err();
        assert!(matches!(err, EngineError::DirectoryExists { .. }));
        assert_ne!(err.exit_code(), 0);

        assert_eq!(contents(&first.snapshot_path), contents(&src));
        let snapshots = namer::list_snapshots(&dst).expect("list");
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].partial);
    }

    #[test]
    fn test_collision_with_archived_snapshot() {
        let (_temp, src, dst) = setup();
        let options = BackupOptions::new(BackupMode::Full).with_compression(Some(Compression::Tar));
        backup_at(&src, &dst, options.clone(), 0).expect("First backup failed");

        let err = backup_at(&src, &dst, options, 0).unwrap_err();
        assert!(matches!(err, EngineError::DirectoryExists { .. }));
    }

    #[test]
    fn test_compressed_snapshot_matches_uncompressed() {
        let (temp, src, dst) = setup();
        fs::create_dir(src.join("docs")).expect("mkdir");
        fs::write(src.join("docs").join("report.docx"), b"Test content 512\n").expect("write");

        let plain = backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0)
            .expect("Plain backup failed");

        let options = BackupOptions::new(BackupMode::Full)
            .with_compression(Some(Compression::Bzip2(Level::new(9).unwrap())));
        let archived = backup_at(&src, &dst, options, 1).expect("Compressed backup failed");

        assert!(archived.snapshot_path.is_file());
        assert!(!dst.join(&archived.snapshot_name).exists());

        let restored = temp.path().join("restored");
        let file = fs::File::open(&archived.snapshot_path).expect("open");
        tar::Archive::new(bzip2::read::BzDecoder::new(file))
            .unpack(&restored)
            .expect("unpack");
        assert_eq!(
            contents(&restored.join(&archived.snapshot_name)),
            contents(&plain.snapshot_path)
        );
    }

    #[test]
    fn test_incremental_after_archive_uses_latest_directory() {
        let (_temp, src, dst) = setup();
        let plain = backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0)
            .expect("Plain backup failed");
        let options = BackupOptions::new(BackupMode::Incremental)
            .with_compression(Some(Compression::Gzip(Level::new(6).unwrap())));
        backup_at(&src, &dst, options, 1).expect("Archived backup failed");

        let incremental = backup_at(&src, &dst, BackupOptions::new(BackupMode::Incremental), 2)
            .expect("Incremental failed");
        assert_eq!(incremental.reference.as_deref(), Some(plain.snapshot_name.as_str()));
        assert_eq!(incremental.sync.files_copied, 0);
    }

    #[test]
    fn test_checksum_detection_catches_same_size_edit() {
        let (_temp, src, dst) = setup();
        touch(&src.join("a.log"), 1_600_000_000);
        backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0).expect("Full failed");

        // Same size and mtime, different bytes
        fs::write(src.join("a.log"), vec![b'z'; 100]).expect("write");
        touch(&src.join("a.log"), 1_600_000_000);

        let cheap = backup_at(&src, &dst, BackupOptions::new(BackupMode::Incremental), 1)
            .expect("Incremental failed");
        assert_eq!(cheap.sync.files_copied, 0);

        let options = BackupOptions::new(BackupMode::Incremental)
            .with_detection(ChangeDetection::Checksum(ChecksumAlgorithm::Blake3));
        let thorough = backup_at(&src, &dst, options, 2).expect("Incremental failed");
        assert_eq!(thorough.sync.files_copied, 1);
        assert_eq!(
            fs::read(thorough.snapshot_path.join("a.log")).expect("read"),
            vec![b'z'; 100]
        );
    }

    #[test]
    fn test_copy_failure_discards_snapshot() {
        let (_temp, src, dst) = setup();
        let mut job = create_job(&src, &dst, BackupOptions::new(BackupMode::Full))
            .expect("Failed to create job");
        plan_job(&mut job).expect("Failed to plan job");

        fs::remove_file(src.join("b.db")).expect("remove");
        let err = run_job_at(&mut job, at(0), None).unwrap_err();
        assert!(matches!(err, EngineError::CopyFailed { .. }));
        assert_eq!(job.state, JobState::Failed);
        assert!(namer::list_snapshots(&dst).expect("list").is_empty());
        assert!(namer::find_reference(&dst).expect("lookup").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_entries_are_skipped() {
        let (_temp, src, dst) = setup();
        std::os::unix::fs::symlink(src.join("missing.db"), src.join("broken.db"))
            .expect("symlink");

        let report = backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0)
            .expect("A broken symlink must not abort the run");
        assert_eq!(report.skipped_entries, 1);
        assert_eq!(report.sync.files_copied, 2);
        assert!(!report.snapshot_path.join("broken.db").exists());
    }

    #[test]
    fn test_archived_leftovers_stay_flagged_partial() {
        let (_temp, _src, dst) = setup();
        let reserved = namer::reserve_snapshot(&dst, at(0)).expect("Failed to reserve");
        fs::write(reserved.path.join("half-removed.db"), b"b").expect("write");

        settle_archived(reserved).expect("Failed to settle");

        let snapshots = namer::list_snapshots(&dst).expect("list");
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].partial);
        assert!(namer::find_reference(&dst).expect("lookup").is_none());
    }

    #[test]
    fn test_archived_snapshot_marker_is_removed() {
        let (_temp, _src, dst) = setup();
        let reserved = namer::reserve_snapshot(&dst, at(0)).expect("Failed to reserve");
        fs::write(reserved.path.join("b.db"), b"b").expect("write");

        let archive = archive_snapshot(reserved, Compression::Tar).expect("Failed to archive");
        assert!(archive.is_file());

        let names: Vec<_> = fs::read_dir(&dst)
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![archive.file_name().expect("name").to_os_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_source_directory_is_preserved_and_archived() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, src, dst) = setup();
        fs::create_dir(src.join("frozen")).expect("mkdir");
        fs::write(src.join("frozen").join("c.xls"), b"cells").expect("write");
        touch(&src.join("frozen"), 1_500_000_000);
        fs::set_permissions(src.join("frozen"), fs::Permissions::from_mode(0o555))
            .expect("chmod");

        let plain = backup_at(&src, &dst, BackupOptions::new(BackupMode::Full), 0)
            .expect("Plain backup failed");
        let meta = fs::metadata(plain.snapshot_path.join("frozen")).expect("stat");
        assert_eq!(meta.permissions().mode() & 0o777, 0o555);
        assert_eq!(
            filetime::FileTime::from_last_modification_time(&meta),
            filetime::FileTime::from_unix_time(1_500_000_000, 0)
        );

        let options = BackupOptions::new(BackupMode::Full).with_compression(Some(Compression::Tar));
        let archived = backup_at(&src, &dst, options, 1).expect("Archived backup failed");
        assert!(!dst.join(&archived.snapshot_name).exists());
        assert!(namer::list_snapshots(&dst)
            .expect("list")
            .iter()
            .all(|s| !s.partial));

        fs::set_permissions(src.join("frozen"), fs::Permissions::from_mode(0o755))
            .expect("chmod");
        fs::set_permissions(
            plain.snapshot_path.join("frozen"),
            fs::Permissions::from_mode(0o755),
        )
        .expect("chmod");
    }

    #[test]
    fn test_run_backup_convenience() {
        let (_temp, src, dst) = setup();
        let report = run_backup(&src, &dst, BackupOptions::new(BackupMode::Full), None)
            .expect("Backup failed");
        assert!(report.snapshot_path.starts_with(&dst));
        assert!(namer::parse_snapshot_name(&report.snapshot_name).is_some());
    }
}
