//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the backup
//! engine from whatever front end drives it.

use crate::job::BackupReport;
use crate::model::BackupJob;
use crate::sync::MaterializedEntry;

/// Trait for receiving progress updates from a backup job.
///
/// `on_entry_completed` is invoked from the copy worker threads, in no
/// particular order, hence the `Sync` bound.
pub trait ProgressCallback: Send + Sync {
    /// Called once the snapshot directory has been reserved.
    fn on_backup_started(&self, job: &BackupJob, snapshot_name: &str);

    /// Called after each file has been copied or linked into the snapshot.
    fn on_entry_completed(&self, entry: &MaterializedEntry);

    /// Called when the snapshot is complete (and archived, if requested).
    fn on_backup_completed(&self, job: &BackupJob, report: &BackupReport);
}
