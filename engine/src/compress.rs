//! Compression pipeline: turns a finished snapshot directory into one archive.
//!
//! The codec is chosen with a single token (`-c`, `-cz6`, `-cj9`, `-cJ` on the
//! command line), parsed once into [`Compression`].

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{info, warn};

use crate::error::EngineError;
use crate::fs_ops;

/// File extensions of every archive the pipeline can produce.
pub const ARCHIVE_EXTENSIONS: [&str; 4] = [".tar", ".tar.gz", ".tar.bz2", ".tar.xz"];

/// xz has no level in the token; the library's default preset is used.
const XZ_PRESET: u32 = 6;

/// A compression level between 1 (fastest) and 9 (smallest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(u32);

impl Level {
    pub fn new(level: u32) -> Result<Self, EngineError> {
        if (1..=9).contains(&level) {
            Ok(Level(level))
        } else {
            Err(EngineError::Configuration {
                message: format!("compression level {} out of range 1-9", level),
            })
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// Archive format applied to a finished snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Uncompressed tar
    Tar,
    Gzip(Level),
    Bzip2(Level),
    Xz,
}

impl Compression {
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Tar => ".tar",
            Compression::Gzip(_) => ".tar.gz",
            Compression::Bzip2(_) => ".tar.bz2",
            Compression::Xz => ".tar.xz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Tar => write!(f, "tar"),
            Compression::Gzip(level) => write!(f, "gzip level {}", level.get()),
            Compression::Bzip2(level) => write!(f, "bzip2 level {}", level.get()),
            Compression::Xz => write!(f, "xz"),
        }
    }
}

impl FromStr for Compression {
    type Err = EngineError;

    /// Parse the part of a `-c` flag after the `c`: `""`/`tar`, `z<1-9>`,
    /// `j<1-9>` or `J`.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| EngineError::Configuration {
            message: format!("invalid compression '-c{}': {}", token, why),
        };
        let level = |digits: &str, codec: &str| -> Result<Level, EngineError> {
            if digits.is_empty() {
                return Err(invalid(&format!("{} requires a level 1-9", codec)));
            }
            let value: u32 = digits
                .parse()
                .map_err(|_| invalid(&format!("'{}' is not a level", digits)))?;
            Level::new(value).map_err(|_| invalid("level must be 1-9"))
        };

        match token {
            "" | "tar" => Ok(Compression::Tar),
            "J" => Ok(Compression::Xz),
            _ => {
                if let Some(digits) = token.strip_prefix('z') {
                    Ok(Compression::Gzip(level(digits, "gzip")?))
                } else if let Some(digits) = token.strip_prefix('j') {
                    Ok(Compression::Bzip2(level(digits, "bzip2")?))
                } else {
                    Err(invalid("expected -c, -cz<level>, -cj<level> or -cJ"))
                }
            }
        }
    }
}

/// Archive a fully populated snapshot directory and remove the directory.
///
/// The archive is written next to the directory as `<name><extension>` and
/// is never allowed to replace an existing file. On failure the partial
/// archive is deleted and the directory is left untouched.
pub fn compress_snapshot(
    snapshot_dir: &Path,
    compression: Compression,
) -> Result<PathBuf, EngineError> {
    let name = snapshot_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EngineError::InvalidPath {
            path: snapshot_dir.to_path_buf(),
            reason: "snapshot directory has no usable name".to_string(),
        })?;
    let archive = snapshot_dir.with_file_name(format!("{}{}", name, compression.extension()));

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&archive)
        .map_err(|e| EngineError::CompressionFailed {
            archive: archive.clone(),
            source: e,
        })?;

    if let Err(e) = write_archive(file, snapshot_dir, name, compression) {
        if let Err(cleanup) = fs::remove_file(&archive) {
            warn!(archive = %archive.display(), error = %cleanup, "could not remove partial archive");
        }
        return Err(EngineError::CompressionFailed { archive, source: e });
    }

    // The archive is complete; a leftover directory is redundant, not harmful
    if let Err(e) = fs_ops::remove_tree(snapshot_dir) {
        warn!(
            snapshot = %snapshot_dir.display(),
            error = %e,
            "archive written but snapshot directory could not be removed"
        );
    }

    info!(archive = %archive.display(), %compression, "snapshot archived");
    Ok(archive)
}

fn write_archive(
    file: File,
    snapshot_dir: &Path,
    name: &str,
    compression: Compression,
) -> io::Result<()> {
    let writer = BufWriter::new(file);
    let writer = match compression {
        Compression::Tar => append_tree(writer, snapshot_dir, name)?,
        Compression::Gzip(level) => {
            let encoder =
                flate2::write::GzEncoder::new(writer, flate2::Compression::new(level.get()));
            append_tree(encoder, snapshot_dir, name)?.finish()?
        }
        Compression::Bzip2(level) => {
            let encoder =
                bzip2::write::BzEncoder::new(writer, bzip2::Compression::new(level.get()));
            append_tree(encoder, snapshot_dir, name)?.finish()?
        }
        Compression::Xz => {
            let encoder = xz2::write::XzEncoder::new(writer, XZ_PRESET);
            append_tree(encoder, snapshot_dir, name)?.finish()?
        }
    };

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Write `dir` into a tar stream under the top-level directory `name`.
///
/// Hard-linked files are stored as regular files, so an archived incremental
/// snapshot does not depend on older snapshots.
fn append_tree<W: Write>(writer: W, dir: &Path, name: &str) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(true);
    builder.append_dir_all(name, dir)?;
    builder.into_inner()
}
