//! Snapshot naming and lookup.
//!
//! Snapshots live directly under the destination root and are named after
//! their creation time at second resolution (UTC, `YYYY-MM-DD_HH-MM-SS`), so
//! lexicographic order is chronological order. A compressed snapshot keeps the
//! same stem with an archive extension.
//!
//! While a snapshot is being written a `.<name>.partial` marker sits next to
//! it. Directories with a marker are never picked as a reference.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::compress::ARCHIVE_EXTENSIONS;
use crate::error::EngineError;
use crate::fs_ops;

/// strftime format of snapshot names.
pub const NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const PARTIAL_SUFFIX: &str = ".partial";

/// Format a snapshot name for the given instant.
pub fn snapshot_name(now: DateTime<Utc>) -> String {
    now.format(NAME_FORMAT).to_string()
}

/// Parse a snapshot name back into its creation time.
pub fn parse_snapshot_name(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, NAME_FORMAT).ok()
}

fn marker_path(destination_root: &Path, name: &str) -> PathBuf {
    destination_root.join(format!(".{}{}", name, PARTIAL_SUFFIX))
}

/// A snapshot found under the destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Timestamp stem shared by the directory and its archive
    pub name: String,
    /// Directory or archive file
    pub path: PathBuf,
    pub created: NaiveDateTime,
    /// True if this snapshot was compressed into an archive
    pub archived: bool,
    /// True if an in-progress marker is still present
    pub partial: bool,
}

/// A freshly created, still empty snapshot directory.
///
/// Call [`ReservedSnapshot::commit`] or [`ReservedSnapshot::discard`] once
/// materialization has finished. Dropping it without either leaves the
/// marker in place, so whatever remains is never used as a reference.
#[derive(Debug)]
pub struct ReservedSnapshot {
    pub name: String,
    pub path: PathBuf,
    marker: PathBuf,
}

impl ReservedSnapshot {
    /// Mark the snapshot complete so later runs may use it as a reference.
    pub fn commit(self) -> Result<PathBuf, EngineError> {
        match fs::remove_file(&self.marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EngineError::DestinationUnavailable {
                    path: self.marker,
                    source: e,
                })
            }
        }
        debug!(snapshot = %self.name, "snapshot committed");
        Ok(self.path)
    }

    /// Remove a snapshot that failed to populate.
    ///
    /// Best effort: if the directory cannot be removed the marker is left in
    /// place so the leftovers are never trusted as a reference.
    pub fn discard(self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                let _ = fs::remove_file(&self.marker);
                debug!(snapshot = %self.name, "partial snapshot removed");
            }
            Err(e) => {
                warn!(
                    snapshot = %self.path.display(),
                    error = %e,
                    "could not remove partial snapshot; leaving it flagged as incomplete"
                );
            }
        }
    }
}

/// Atomically reserve the snapshot directory for `now`.
///
/// Fails with `DirectoryExists` when a snapshot with the same name already
/// exists, either as a directory or as an archive. The name is never
/// disambiguated: two runs within the same second are a hard error.
pub fn reserve_snapshot(
    destination_root: &Path,
    now: DateTime<Utc>,
) -> Result<ReservedSnapshot, EngineError> {
    fs_ops::ensure_dir_exists(destination_root)?;

    let name = snapshot_name(now);
    let path = destination_root.join(&name);

    for ext in ARCHIVE_EXTENSIONS {
        let archive = destination_root.join(format!("{}{}", name, ext));
        if archive.exists() {
            return Err(EngineError::DirectoryExists { path: archive });
        }
    }

    // create_dir (not create_dir_all) fails if the directory is already there
    fs::create_dir(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            EngineError::DirectoryExists { path: path.clone() }
        } else {
            EngineError::DirectoryCreationFailed {
                path: path.clone(),
                source: e,
            }
        }
    })?;

    let marker = marker_path(destination_root, &name);
    if let Err(e) = fs::File::create(&marker) {
        let _ = fs::remove_dir(&path);
        return Err(EngineError::DestinationUnavailable {
            path: marker,
            source: e,
        });
    }

    debug!(snapshot = %path.display(), "snapshot directory reserved");
    Ok(ReservedSnapshot { name, path, marker })
}

/// List all snapshots under the destination root, oldest first.
///
/// Entries whose name is not a snapshot timestamp are ignored. A missing
/// destination root yields an empty list.
pub fn list_snapshots(destination_root: &Path) -> Result<Vec<SnapshotInfo>, EngineError> {
    let entries = match fs::read_dir(destination_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(EngineError::DestinationUnavailable {
                path: destination_root.to_path_buf(),
                source: e,
            })
        }
    };

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::DestinationUnavailable {
            path: destination_root.to_path_buf(),
            source: e,
        })?;
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        let (stem, archived) = if file_type.is_dir() {
            (file_name.as_str(), false)
        } else if file_type.is_file() {
            match ARCHIVE_EXTENSIONS
                .iter()
                .find_map(|ext| file_name.strip_suffix(ext))
            {
                Some(stem) => (stem, true),
                None => continue,
            }
        } else {
            continue;
        };

        let Some(created) = parse_snapshot_name(stem) else {
            continue;
        };

        snapshots.push(SnapshotInfo {
            name: stem.to_string(),
            path: entry.path(),
            created,
            archived,
            partial: marker_path(destination_root, stem).exists(),
        });
    }

    snapshots.sort_by(|a, b| a.name.cmp(&b.name).then(a.archived.cmp(&b.archived)));
    Ok(snapshots)
}

/// Locate the reference snapshot: the newest complete, uncompressed snapshot.
///
/// Archives cannot be linked against and partial snapshots cannot be trusted,
/// so both are passed over.
pub fn find_reference(destination_root: &Path) -> Result<Option<SnapshotInfo>, EngineError> {
    let snapshots = list_snapshots(destination_root)?;
    for snapshot in snapshots.iter().rev() {
        if snapshot.partial {
            warn!(snapshot = %snapshot.path.display(), "ignoring incomplete snapshot");
            continue;
        }
        if !snapshot.archived {
            return Ok(Some(snapshot.clone()));
        }
    }
    Ok(None)
}
