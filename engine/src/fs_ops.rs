//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating directory trees, skipping entries that cannot be read
//! - Copying files with modification-time preservation
//! - Hard-linking files between snapshots
//! - Creating directories recursively

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::model::{EntryKind, SkippedEntry, SourceEntry};

/// Result of scanning a tree: readable entries plus the ones left out.
#[derive(Debug, Default)]
pub struct TreeScan {
    pub entries: Vec<SourceEntry>,
    pub skipped: Vec<SkippedEntry>,
}

/// Enumerate a directory tree and return all files and subdirectories.
///
/// Entries are returned sorted by relative path. Entries that cannot be read
/// (permission denied, broken symlinks, unreadable subdirectories) are logged
/// and reported in `TreeScan::skipped`; only a failure to read the root itself
/// is an error.
///
/// Symlinks to files are followed. Symlinks to directories are skipped so a
/// link cycle cannot make the walk unbounded.
///
/// # Errors
/// `SourceNotFound` if the root does not exist, `SourceUnreadable` if it
/// cannot be listed.
pub fn enumerate_tree(root: &Path) -> Result<TreeScan, EngineError> {
    let entries = fs::read_dir(root).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            EngineError::SourceNotFound {
                path: root.to_path_buf(),
            }
        } else {
            EngineError::SourceUnreadable {
                path: root.to_path_buf(),
                source: e,
            }
        }
    })?;

    let mut scan = TreeScan::default();
    recurse(entries, root, Path::new(""), &mut scan);
    scan.entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(scan)
}

fn recurse(entries: fs::ReadDir, dir: &Path, rel_dir: &Path, scan: &mut TreeScan) {
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                skip(scan, dir.to_path_buf(), format!("failed to read directory entry: {}", e));
                continue;
            }
        };

        let entry_path = entry.path();
        let rel_path = rel_dir.join(entry.file_name());

        let is_symlink = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
        // fs::metadata follows symlinks, so a dangling link fails here
        let metadata = match fs::metadata(&entry_path) {
            Ok(metadata) => metadata,
            Err(e) => {
                skip(scan, entry_path, e.to_string());
                continue;
            }
        };

        if metadata.is_dir() {
            if is_symlink {
                skip(scan, entry_path, "symlinked directory not followed".to_string());
                continue;
            }

            match fs::read_dir(&entry_path) {
                Ok(children) => {
                    scan.entries.push(SourceEntry {
                        rel_path: rel_path.clone(),
                        path: entry_path.clone(),
                        kind: EntryKind::Dir,
                        size: 0,
                        modified: Some(FileTime::from_last_modification_time(&metadata)),
                    });
                    recurse(children, &entry_path, &rel_path, scan);
                }
                Err(e) => skip(scan, entry_path, e.to_string()),
            }
        } else if metadata.is_file() {
            // Stat succeeding does not mean the content is readable
            if let Err(e) = fs::File::open(&entry_path) {
                skip(scan, entry_path, e.to_string());
                continue;
            }
            scan.entries.push(SourceEntry {
                rel_path,
                path: entry_path,
                kind: EntryKind::File,
                size: metadata.len(),
                modified: Some(FileTime::from_last_modification_time(&metadata)),
            });
        } else {
            skip(scan, entry_path, "not a regular file or directory".to_string());
        }
    }
}

fn skip(scan: &mut TreeScan, path: PathBuf, reason: String) {
    warn!(path = %path.display(), %reason, "skipping unreadable entry");
    scan.skipped.push(SkippedEntry { path, reason });
}

/// Copy a file from source to destination, preserving its modification time.
///
/// The destination must not exist yet; snapshot files are never overwritten.
///
/// # Returns
/// Number of bytes copied
///
/// # Errors
/// Returns `CopyFailed` if the copy fails
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<u64, EngineError> {
    let copy_failed = |source| EngineError::CopyFailed {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source,
    };

    ensure_parent_dir_exists(dst)?;

    let mut src_file = fs::File::open(src).map_err(copy_failed)?;
    let src_metadata = src_file.metadata().map_err(copy_failed)?;

    let mut dst_file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(copy_failed)?;

    let bytes_copied = io::copy(&mut src_file, &mut dst_file).map_err(copy_failed)?;
    dst_file.sync_all().map_err(copy_failed)?;
    dst_file
        .set_permissions(src_metadata.permissions())
        .map_err(copy_failed)?;
    drop(dst_file);

    // A lost mtime only costs a re-copy on the next incremental run
    let mtime = FileTime::from_last_modification_time(&src_metadata);
    if let Err(e) = filetime::set_file_mtime(dst, mtime) {
        debug!(path = %dst.display(), error = %e, "could not preserve modification time");
    }

    Ok(bytes_copied)
}

/// Create `link` as a hard link to `target`.
///
/// The raw io::Error is returned so callers can decide whether to fall back
/// to a copy (e.g. `EXDEV` across filesystems).
pub fn hard_link(target: &Path, link: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::hard_link(target, link)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns `DirectoryCreationFailed` if directory creation fails
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir_exists(parent),
        _ => Ok(()),
    }
}

/// Ensure a directory exists, creating it and its parents if necessary.
///
/// # Errors
/// Returns `DirectoryCreationFailed` if the path exists as a non-directory
/// or cannot be created.
pub fn ensure_dir_exists(dir: &Path) -> Result<(), EngineError> {
    match fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| EngineError::DirectoryCreationFailed {
                path: dir.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Canonicalize a path that may not exist yet.
///
/// The nearest existing ancestor is canonicalized and the missing trailing
/// components are appended back unchanged.
pub fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut missing = Vec::new();
    let mut current = absolute.as_path();

    loop {
        match current.canonicalize() {
            Ok(mut resolved) => {
                for component in missing.iter().rev() {
                    resolved.push(component);
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match (current.parent(), current.file_name()) {
                    (Some(parent), Some(name)) => {
                        missing.push(name.to_os_string());
                        current = parent;
                    }
                    // `..` below a missing directory cannot be resolved
                    _ => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Give a snapshot directory the permissions and mtime of its source.
///
/// Must run after the directory has been populated, since adding entries
/// bumps its mtime. Failures only cost fidelity and are logged.
pub fn copy_dir_metadata(entry: &SourceEntry, dst: &Path) {
    match fs::metadata(&entry.path) {
        Ok(metadata) => {
            if let Err(e) = fs::set_permissions(dst, metadata.permissions()) {
                debug!(path = %dst.display(), error = %e, "could not preserve directory permissions");
            }
        }
        Err(e) => debug!(path = %entry.path.display(), error = %e, "could not stat source directory"),
    }

    if let Some(mtime) = entry.modified {
        if let Err(e) = filetime::set_file_mtime(dst, mtime) {
            debug!(path = %dst.display(), error = %e, "could not preserve modification time");
        }
    }
}

/// Remove a directory tree, including read-only subdirectories copied
/// verbatim from the source.
pub fn remove_tree(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            grant_owner_write(dir)?;
            fs::remove_dir_all(dir)
        }
        other => other,
    }
}

#[cfg(unix)]
fn grant_owner_write(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::symlink_metadata(dir)?;
    if !metadata.is_dir() {
        return Ok(());
    }
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o700);
    fs::set_permissions(dir, permissions)?;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            grant_owner_write(&entry.path())?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn grant_owner_write(_dir: &Path) -> io::Result<()> {
    Ok(())
}
