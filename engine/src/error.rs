//! Error types for the backup engine.
//!
//! The primary error type is `EngineError`. Every variant is fatal for the
//! run that produced it. Unreadable individual source entries are not errors:
//! they are recorded as `SkippedEntry` on the job and the run carries on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a backup run.
///
/// Each variant belongs to one failure kind, and each kind maps to a distinct
/// process exit code via [`EngineError::exit_code`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad mode, compression token or option combination
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// Snapshot name already taken (two runs within the same second)
    #[error("Failed to create directory {}: snapshot already exists", path.display())]
    DirectoryExists { path: PathBuf },

    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source directory exists but cannot be read
    #[error("Source directory is not readable: {}: {source}", path.display())]
    SourceUnreadable { path: PathBuf, source: io::Error },

    /// Source or destination path is unusable
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Destination root cannot be created or listed
    #[error("Destination is not accessible: {}: {source}", path.display())]
    DestinationUnavailable { path: PathBuf, source: io::Error },

    /// Failed to create a directory inside the snapshot
    #[error("Failed to create directory {}: {source}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// Failed to read a file while hashing it
    #[error("Failed to read file {}: {source}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to copy a file into the snapshot
    #[error("Failed to copy {} to {}: {source}", from.display(), to.display())]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// A copied file does not hash to the same value as its source
    #[error("Verification failed for {}: expected {expected}, found {actual}", path.display())]
    VerificationFailed {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Archive creation failed; the uncompressed snapshot was kept
    #[error("Failed to create archive {}: {source}", archive.display())]
    CompressionFailed { archive: PathBuf, source: io::Error },

    /// Job driven out of order (e.g. run before plan)
    #[error("Invalid job state: {message}")]
    InvalidState { message: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SourceUnreadable { source, .. }
            | Self::DestinationUnavailable { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::ReadError { source, .. }
            | Self::CopyFailed { source, .. }
            | Self::CompressionFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Process exit status for this failure kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } => 2,
            Self::DirectoryExists { .. } => 3,
            Self::SourceNotFound { .. }
            | Self::SourceUnreadable { .. }
            | Self::InvalidPath { .. } => 4,
            Self::DestinationUnavailable { .. }
            | Self::DirectoryCreationFailed { .. }
            | Self::ReadError { .. }
            | Self::CopyFailed { .. }
            | Self::VerificationFailed { .. } => 5,
            Self::CompressionFailed { .. } => 6,
            Self::InvalidState { .. } => 1,
        }
    }

    /// True for failures detected before anything was written to the destination.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::DirectoryExists { .. }
                | Self::SourceNotFound { .. }
                | Self::SourceUnreadable { .. }
                | Self::InvalidPath { .. }
        )
    }
}
