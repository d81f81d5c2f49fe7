//! Core data model for backup jobs.
//!
//! This module defines the main data structures for representing a backup run:
//! - BackupJob: one invocation of the engine against a source tree
//! - SourceEntry: a single file or directory found in the source tree
//! - BackupMode, ChangeDetection, LinkPolicy, JobState: enums controlling behavior
//! - BackupOptions: the validated configuration handed to the engine

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use filetime::FileTime;
use uuid::Uuid;

use crate::checksums::ChecksumAlgorithm;
use crate::compress::Compression;
use crate::detect::ChangeSet;
use crate::error::EngineError;
use crate::namer::SnapshotInfo;

/// Represents a single backup job (one snapshot of one source tree).
#[derive(Debug)]
pub struct BackupJob {
    /// Unique identifier for this run, used in log output
    pub id: Uuid,

    /// Root source directory
    pub source_path: PathBuf,

    /// Directory under which snapshots are created
    pub destination_root: PathBuf,

    /// Validated run configuration
    pub options: BackupOptions,

    /// Reference snapshot looked up at plan time (incremental and mirror only)
    pub reference: Option<SnapshotInfo>,

    /// Classified source tree, populated by planning
    pub changes: Option<ChangeSet>,

    /// Source entries that could not be read and were left out
    pub skipped: Vec<SkippedEntry>,

    /// Current job state
    pub state: JobState,

    /// When job was created
    pub created_at: SystemTime,

    /// When job execution started
    pub start_time: Option<SystemTime>,

    /// When job execution completed
    pub end_time: Option<SystemTime>,
}

impl BackupJob {
    /// The mode the snapshot is actually produced with.
    ///
    /// Incremental and mirror runs without a usable reference snapshot
    /// behave like a full backup.
    pub fn effective_mode(&self) -> BackupMode {
        match (self.options.mode, &self.reference) {
            (BackupMode::Full, _) | (_, None) => BackupMode::Full,
            (mode, Some(_)) => mode,
        }
    }
}

/// Validated configuration for a backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub mode: BackupMode,

    /// Archive the finished snapshot; `None` keeps a plain directory
    pub compression: Option<Compression>,

    pub detection: ChangeDetection,

    pub link_policy: LinkPolicy,

    /// Upper bound on concurrent file copies (at least 1)
    pub jobs: usize,

    /// Re-hash freshly copied files and compare them with the source
    pub verify_after_copy: Option<ChecksumAlgorithm>,
}

impl BackupOptions {
    pub fn new(mode: BackupMode) -> Self {
        BackupOptions {
            mode,
            compression: None,
            detection: ChangeDetection::SizeAndMtime,
            link_policy: LinkPolicy::HardLink,
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            verify_after_copy: None,
        }
    }

    pub fn with_compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_detection(mut self, detection: ChangeDetection) -> Self {
        self.detection = detection;
        self
    }

    pub fn with_link_policy(mut self, link_policy: LinkPolicy) -> Self {
        self.link_policy = link_policy;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_verification(mut self, algorithm: Option<ChecksumAlgorithm>) -> Self {
        self.verify_after_copy = algorithm;
        self
    }
}

/// Backup semantics selected with `-m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Copy the whole source tree
    Full,
    /// Copy new and modified files, link everything else to the reference
    Incremental,
    /// Reproduce the source tree exactly, dropping entries deleted from it
    Mirror,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => write!(f, "full"),
            BackupMode::Incremental => write!(f, "incremental"),
            BackupMode::Mirror => write!(f, "mirror"),
        }
    }
}

impl FromStr for BackupMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(BackupMode::Full),
            "incremental" => Ok(BackupMode::Incremental),
            "mirror" => Ok(BackupMode::Mirror),
            _ => Err(EngineError::Configuration {
                message: format!(
                    "invalid mode '{}'; must be 'full', 'incremental' or 'mirror'",
                    s
                ),
            }),
        }
    }
}

/// How a source file is compared against its counterpart in the reference snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDetection {
    /// Equal size and modification time means unchanged
    SizeAndMtime,
    /// Equal size and equal content checksum means unchanged
    Checksum(ChecksumAlgorithm),
}

/// How unchanged files are represented in a new snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPolicy {
    /// Hard-link to the reference copy, copying when the filesystem refuses
    HardLink,
    /// Always write a fresh copy
    Copy,
}

/// Kind of a source or snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// A file or directory in a scanned tree.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Path relative to the tree root
    pub rel_path: PathBuf,

    /// Absolute (or root-joined) path used for reading
    pub path: PathBuf,

    pub kind: EntryKind,

    /// Size in bytes (0 for directories)
    pub size: u64,

    /// Modification time, when the platform reports one
    pub modified: Option<FileTime>,
}

impl SourceEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// A source entry left out of the snapshot because it could not be read.
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// The state of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Created, not yet planned
    Pending,
    /// Reference located and change set computed
    Planned,
    /// Snapshot reserved, currently materializing
    Running,
    /// Snapshot complete (and compressed, if requested)
    Completed,
    /// Run aborted; see the returned error
    Failed,
}

impl JobState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}
