//! BackUP - Command-line interface for the snapshot backup engine.
//!
//! Parses the command line, sets up logging, runs one backup and maps the
//! outcome to a process exit status.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use clap::Parser;
use engine::{
    run_backup, BackupJob, BackupMode, BackupOptions, BackupReport, ChangeDetection,
    ChecksumAlgorithm, Compression, EngineError, EntryOutcome, LinkPolicy, MaterializedEntry,
    ProgressCallback,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// BackUP - timestamped full, incremental and mirror snapshots
#[derive(Parser, Debug)]
#[command(name = "backup")]
#[command(version = "0.1.0")]
#[command(about = "Create a timestamped snapshot of a directory")]
#[command(after_help = "Compression: -c (tar), -cz<1-9> (gzip), -cj<1-9> (bzip2), -cJ (xz)")]
struct Args {
    /// Directory to back up
    #[arg(value_name = "SOURCE")]
    source: PathBuf,

    /// Backup mode: full, incremental or mirror
    #[arg(short = 'm', long, value_name = "MODE")]
    mode: String,

    /// Destination root under which snapshots are created
    #[arg(short = 'd', long = "destination", value_name = "PATH")]
    destination: PathBuf,

    /// Archive the snapshot (same tokens as -c: tar, z<level>, j<level>, J)
    #[arg(
        long = "compress",
        value_name = "TOKEN",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "tar"
    )]
    compress: Option<String>,

    /// Compare file contents instead of size and modification time
    #[arg(long)]
    checksum: bool,

    /// Checksum algorithm for --checksum and --verify: md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM", default_value = "blake3")]
    hash: String,

    /// Copy unchanged files instead of hard-linking them to the previous snapshot
    #[arg(long)]
    no_link: bool,

    /// Re-hash copied files and compare them with the source
    #[arg(long)]
    verify: bool,

    /// Number of files copied in parallel
    #[arg(short = 'j', long, value_name = "N")]
    jobs: Option<usize>,

    /// Print every file as it is written, and debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Rewrite tar-style compression flags (`-c`, `-cz6`, `-cj9`, `-cJ`) into
/// `--compress=<token>` so the token is never mistaken for a separate value.
fn normalize_args<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
    let mut normalized = Vec::new();
    let mut literal = false;

    for (index, arg) in args.into_iter().enumerate() {
        if index == 0 || literal {
            normalized.push(arg);
            continue;
        }
        if arg == "--" {
            literal = true;
            normalized.push(arg);
            continue;
        }
        match arg.to_str().and_then(|s| s.strip_prefix("-c")) {
            Some("") => normalized.push(OsString::from("--compress=tar")),
            Some(token) => normalized.push(OsString::from(format!("--compress={}", token))),
            None => normalized.push(arg),
        }
    }

    normalized
}

/// CLI implementation of ProgressCallback
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    total_files: AtomicUsize,
    files_done: AtomicUsize,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            total_files: AtomicUsize::new(0),
            files_done: AtomicUsize::new(0),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_backup_started(&self, job: &BackupJob, snapshot_name: &str) {
        let (files, bytes) = job
            .changes
            .as_ref()
            .map(|c| (c.file_count(), c.bytes_to_copy()))
            .unwrap_or((0, 0));
        self.total_files.store(files, Ordering::Relaxed);

        eprintln!("Backing up {}", job.source_path.display());
        eprintln!("  Snapshot: {}", job.destination_root.join(snapshot_name).display());
        eprintln!("  Mode: {}", job.effective_mode());
        if job.effective_mode() != job.options.mode {
            eprintln!("  (no previous snapshot; {} runs as a full backup)", job.options.mode);
        }
        eprintln!(
            "  To copy: {} across {} files",
            Self::format_bytes(bytes),
            files
        );
    }

    fn on_entry_completed(&self, entry: &MaterializedEntry) {
        let done = self.files_done.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.verbose {
            return;
        }
        let action = match entry.outcome {
            EntryOutcome::Copied { .. } => "copied",
            EntryOutcome::Linked => "linked",
            EntryOutcome::LinkFallback { .. } => "copied (link failed)",
        };
        let total = self.total_files.load(Ordering::Relaxed).max(done);
        eprintln!("[{:>5}/{}] {}: {}", done, total, action, entry.rel_path.display());
    }

    fn on_backup_completed(&self, _job: &BackupJob, report: &BackupReport) {
        let sync = &report.sync;
        eprintln!("Backup complete: {}", report.snapshot_path.display());
        eprintln!(
            "Summary: {} copied, {} linked, {} link fallbacks, {} skipped",
            sync.files_copied, sync.files_linked, sync.link_fallbacks, report.skipped_entries
        );
        if sync.files_carried_forward > 0 {
            eprintln!("Kept from previous snapshot: {}", sync.files_carried_forward);
        }
        if sync.entries_removed > 0 {
            eprintln!("Removed since previous snapshot: {}", sync.entries_removed);
        }
        if let Some(compression) = report.compression {
            eprintln!("Archive: {}", compression);
        }
        eprintln!("Bytes written: {}", Self::format_bytes(sync.bytes_written));
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Parse arguments, then run the backup
fn main() {
    let args = Args::parse_from(normalize_args(std::env::args_os()));
    init_logging(args.verbose);
    debug!(?args, "parsed arguments");

    let progress = CliProgress::new(args.verbose);
    let exit_code = match run_cli(&args, Some(&progress)) {
        Ok(_) => 0,
        Err(e) => {
            if let Some(code) = e.raw_os_error() {
                debug!(os_error = code, "backup failed with an OS error");
            }
            if e.is_preflight() {
                debug!("destination was left untouched");
            }
            eprintln!("ERROR: {}", e);
            e.exit_code()
        }
    };

    std::process::exit(exit_code);
}

/// Turn the raw arguments into validated engine options.
///
/// Every token is checked here, before anything touches the filesystem.
fn build_options(args: &Args) -> Result<BackupOptions, EngineError> {
    let mode: BackupMode = args.mode.parse()?;
    let compression = args
        .compress
        .as_deref()
        .map(str::parse::<Compression>)
        .transpose()?;
    let algorithm: ChecksumAlgorithm = args.hash.parse()?;

    let detection = if args.checksum {
        ChangeDetection::Checksum(algorithm)
    } else {
        ChangeDetection::SizeAndMtime
    };
    let link_policy = if args.no_link {
        LinkPolicy::Copy
    } else {
        LinkPolicy::HardLink
    };

    let mut options = BackupOptions::new(mode)
        .with_compression(compression)
        .with_detection(detection)
        .with_link_policy(link_policy)
        .with_verification(args.verify.then_some(algorithm));

    match args.jobs {
        Some(0) => {
            return Err(EngineError::Configuration {
                message: "--jobs must be at least 1".to_string(),
            })
        }
        Some(jobs) => options = options.with_jobs(jobs),
        None => {}
    }

    Ok(options)
}

/// Main CLI logic - separated for testability
fn run_cli(
    args: &Args,
    progress: Option<&dyn ProgressCallback>,
) -> Result<BackupReport, EngineError> {
    let options = build_options(args)?;
    run_backup(&args.source, &args.destination, options, progress)
}
