//! Change detection between a source tree and the reference snapshot.
//!
//! Every source file lands in exactly one of `new`, `modified` or `unchanged`.
//! Paths that exist only in the reference end up in `reference_only`; mirror
//! runs treat those as removed, incremental runs carry them forward.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::checksums::{compute_file_checksum, ChecksumAlgorithm};
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{ChangeDetection, EntryKind, SourceEntry};

/// A source file whose content already exists in the reference snapshot.
#[derive(Debug, Clone)]
pub struct UnchangedEntry {
    pub entry: SourceEntry,
    /// The reference snapshot's copy of this file
    pub reference_path: PathBuf,
}

/// Per-run classification of the source tree.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Source directories; always recreated
    pub directories: Vec<SourceEntry>,
    /// Files absent from the reference
    pub new: Vec<SourceEntry>,
    /// Files whose signature differs from the reference copy
    pub modified: Vec<SourceEntry>,
    pub unchanged: Vec<UnchangedEntry>,
    /// Reference entries with no counterpart in the source; `path` points
    /// into the reference snapshot
    pub reference_only: Vec<SourceEntry>,
}

impl ChangeSet {
    /// Classify a tree without a reference: every file is new.
    pub fn all_new(entries: Vec<SourceEntry>) -> Self {
        let (directories, new) = entries.into_iter().partition(|e| e.is_dir());
        ChangeSet {
            directories,
            new,
            ..Default::default()
        }
    }

    /// Files that need fresh content written.
    pub fn to_copy(&self) -> impl Iterator<Item = &SourceEntry> {
        self.new.iter().chain(self.modified.iter())
    }

    /// Total bytes of new and modified files.
    pub fn bytes_to_copy(&self) -> u64 {
        self.to_copy().map(|e| e.size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.new.len() + self.modified.len() + self.unchanged.len()
    }
}

/// List the reference snapshot's contents.
pub fn scan_reference(reference_root: &Path) -> Result<Vec<SourceEntry>, EngineError> {
    let scan = fs_ops::enumerate_tree(reference_root).map_err(|e| match e {
        EngineError::SourceNotFound { path } => EngineError::DestinationUnavailable {
            path,
            source: std::io::ErrorKind::NotFound.into(),
        },
        EngineError::SourceUnreadable { path, source } => {
            EngineError::DestinationUnavailable { path, source }
        }
        other => other,
    })?;
    Ok(scan.entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    New,
    Modified,
    Unchanged,
}

/// Classify source entries against the reference snapshot listing.
///
/// `reference_root` is the reference snapshot directory; `reference` its
/// entries as returned by [`scan_reference`].
pub fn detect_changes(
    source: Vec<SourceEntry>,
    reference_root: &Path,
    reference: Vec<SourceEntry>,
    detection: ChangeDetection,
) -> ChangeSet {
    let reference_by_path: HashMap<&Path, &SourceEntry> = reference
        .iter()
        .map(|e| (e.rel_path.as_path(), e))
        .collect();

    let (directories, files): (Vec<_>, Vec<_>) = source.into_iter().partition(|e| e.is_dir());

    // Checksum comparison dominates the cost, so files are classified in parallel
    let classified: Vec<(SourceEntry, Class)> = files
        .into_par_iter()
        .map(|entry| {
            let class = match reference_by_path.get(entry.rel_path.as_path()) {
                None => Class::New,
                Some(reference_entry) if reference_entry.kind != EntryKind::File => {
                    Class::Modified
                }
                Some(reference_entry) => {
                    if signature_matches(&entry, reference_entry, detection) {
                        Class::Unchanged
                    } else {
                        Class::Modified
                    }
                }
            };
            (entry, class)
        })
        .collect();

    let mut changes = ChangeSet {
        directories,
        ..Default::default()
    };

    let mut source_files: HashSet<PathBuf> = HashSet::new();
    let mut source_paths: HashSet<PathBuf> = changes
        .directories
        .iter()
        .map(|d| d.rel_path.clone())
        .collect();

    for (entry, class) in classified {
        source_files.insert(entry.rel_path.clone());
        source_paths.insert(entry.rel_path.clone());
        match class {
            Class::New => changes.new.push(entry),
            Class::Modified => changes.modified.push(entry),
            Class::Unchanged => {
                let reference_path = reference_root.join(&entry.rel_path);
                changes.unchanged.push(UnchangedEntry {
                    entry,
                    reference_path,
                });
            }
        }
    }

    for entry in reference {
        if source_paths.contains(&entry.rel_path) {
            continue;
        }
        // A reference path below something that is now a file cannot be kept
        if entry
            .rel_path
            .ancestors()
            .skip(1)
            .any(|ancestor| source_files.contains(ancestor))
        {
            debug!(path = %entry.rel_path.display(), "reference entry shadowed by source file");
            continue;
        }
        changes.reference_only.push(entry);
    }

    debug!(
        new = changes.new.len(),
        modified = changes.modified.len(),
        unchanged = changes.unchanged.len(),
        reference_only = changes.reference_only.len(),
        "change detection finished"
    );
    changes
}

fn signature_matches(
    source: &SourceEntry,
    reference: &SourceEntry,
    detection: ChangeDetection,
) -> bool {
    if source.size != reference.size {
        return false;
    }
    match detection {
        ChangeDetection::SizeAndMtime => {
            source.modified.is_some() && source.modified == reference.modified
        }
        ChangeDetection::Checksum(algorithm) => {
            checksums_match(&source.path, &reference.path, algorithm)
        }
    }
}

fn checksums_match(source: &Path, reference: &Path, algorithm: ChecksumAlgorithm) -> bool {
    let source_sum = compute_file_checksum(source, algorithm);
    let reference_sum = compute_file_checksum(reference, algorithm);
    match (source_sum, reference_sum) {
        (Ok(a), Ok(b)) => a == b,
        (Err(e), _) | (_, Err(e)) => {
            // Treat as modified; the fresh copy is the safe outcome
            warn!(error = %e, "checksum comparison failed");
            false
        }
    }
}
