//! # BackUP Engine - Snapshot Backup Library
//!
//! A headless engine that produces timestamped snapshots of a directory tree.
//! Designed as the foundation for the `backup` command-line tool.
//!
//! ## Overview
//!
//! Each run creates one snapshot under a destination root, named after its
//! creation time at second resolution. Three modes are supported:
//! - **Full**: copy the whole source tree
//! - **Incremental**: copy new and changed files, hard-link the rest to the
//!   most recent snapshot, keep files that were deleted from the source
//! - **Mirror**: like incremental, but files deleted from the source are left out
//!
//! A finished snapshot can be archived as tar, tar.gz, tar.bz2 or tar.xz.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{create_job, plan_job, run_job, BackupMode, BackupOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = BackupOptions::new(BackupMode::Incremental)
//!     .with_compression(Some("z6".parse()?));
//!
//! let mut job = create_job("/srv/data", "/backups", options)?;
//!
//! // Locate the reference snapshot and classify the source tree
//! plan_job(&mut job)?;
//!
//! // Reserve the snapshot directory, copy/link files, archive
//! let report = run_job(&mut job, None)?;
//! println!("{} -> {}", report.snapshot_name, report.snapshot_path.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (BackupJob, SourceEntry, options, enums)
//! - **error**: Error types and exit codes
//! - **namer**: Snapshot naming, reservation and reference lookup
//! - **fs_ops**: Low-level filesystem operations
//! - **detect**: Change detection against the reference snapshot
//! - **sync**: Copy/link materialization of a change set
//! - **compress**: Archive creation
//! - **job**: Job orchestration (create, plan, run)
//! - **progress**: Progress callback trait
//! - **checksums**: Checksum computation and copy verification

pub mod checksums;
pub mod compress;
pub mod detect;
pub mod error;
pub mod fs_ops;
pub mod job;
pub mod model;
pub mod namer;
pub mod progress;
pub mod sync;

// Re-export main types and functions
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use compress::{Compression, Level};
pub use detect::ChangeSet;
pub use error::EngineError;
pub use job::{create_job, plan_job, run_backup, run_job, run_job_at, BackupReport};
pub use model::{
    BackupJob, BackupMode, BackupOptions, ChangeDetection, EntryKind, JobState, LinkPolicy,
    SkippedEntry, SourceEntry,
};
pub use namer::{find_reference, list_snapshots, SnapshotInfo};
pub use progress::ProgressCallback;
pub use sync::{EntryOutcome, MaterializedEntry, SyncReport};
