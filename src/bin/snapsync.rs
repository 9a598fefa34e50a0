//! # snapsync CLI
//!
//! Incremental tar backups of a directory, driven by a snapshot chain file.
//!
//! ## Usage
//! ```bash
//! # Back up ./photos, extending photos.chain, archive to a file
//! snapsync -c --path ./photos -g photos.chain -o photos-2024-06-01.tar
//!
//! # Same, streaming the archive to stdout
//! snapsync -c --path ./photos -g photos.chain | ssh backup 'cat > p.tar'
//!
//! # Replay an archive onto a mirror
//! snapsync -x --path ./mirror -i photos-2024-06-01.tar
//! ```

use clap::Parser;
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use snapsync::utils::format_bytes;
use snapsync::{BackupReport, RestoreReport, Result, SyncConfig, SyncError, Synchronizer};
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// snapsync - incremental, content-addressed directory backups
#[derive(Parser, Debug)]
#[command(name = "snapsync")]
#[command(version)]
#[command(about = "Incremental tar backups of a directory tree driven by a snapshot chain")]
#[command(long_about = None)]
struct Cli {
    /// Create a backup archive of --path
    #[arg(short = 'c', long)]
    backup: bool,

    /// Restore an archive into --path
    #[arg(short = 'x', long)]
    restore: bool,

    /// Root of the tree to back up or restore into
    #[arg(long)]
    path: Option<PathBuf>,

    /// Snapshot chain file (required for backup)
    #[arg(short = 'g', long)]
    snapshot: Option<PathBuf>,

    /// Archive file to write (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Archive file to read (defaults to stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Configuration file (defaults to ./snapsync.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run catalog directory (overrides the configuration)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// What the command line asks for, once validated
#[derive(Debug)]
enum Mode {
    Backup {
        root: PathBuf,
        chain: PathBuf,
        output: Option<PathBuf>,
    },
    Restore {
        root: PathBuf,
        input: Option<PathBuf>,
    },
}

impl Cli {
    fn mode(&self) -> Result<Mode> {
        let root = self
            .path
            .clone()
            .ok_or_else(|| SyncError::config("Missing parameter: --path"))?;

        match (self.backup, self.restore) {
            (true, false) => {
                let chain = self
                    .snapshot
                    .clone()
                    .ok_or_else(|| SyncError::config("Missing parameter: --snapshot"))?;
                Ok(Mode::Backup {
                    root,
                    chain,
                    output: self.output.clone(),
                })
            }
            (false, true) => {
                if self.snapshot.is_some() {
                    tracing::debug!("--snapshot is ignored on restore; the archive carries its chain");
                }
                Ok(Mode::Restore {
                    root,
                    input: self.input.clone(),
                })
            }
            (true, true) => Err(SyncError::config("Only one of -c or -x may be specified")),
            (false, false) => Err(SyncError::config(
                "Missing parameter: at least one of -c or -x must be specified",
            )),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mode = cli.mode()?;

    let working_dir = std::env::current_dir()?;
    let mut config = SyncConfig::discover(cli.config.as_deref(), &working_dir)?;
    if let Some(db) = &cli.db {
        config.catalog_dir = Some(db.clone());
    }

    match mode {
        Mode::Backup { root, chain, output } => cmd_backup(config, root, chain, output),
        Mode::Restore { root, input } => cmd_restore(config, root, input),
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn build(config: SyncConfig, root: PathBuf, pb: &ProgressBar) -> Result<Synchronizer> {
    let pb = pb.clone();
    Synchronizer::builder()
        .config(config)
        .progress(Arc::new(move |info| {
            let item = info.current_item.unwrap_or_default();
            pb.set_message(format!("{} ({}) {}", info.operation, info.processed, item));
        }))
        .build(root)
}

/// Walk, diff, extend the chain and write the archive
///
/// All human output goes to stderr when the archive itself goes to stdout.
fn cmd_backup(config: SyncConfig, root: PathBuf, chain: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let pb = spinner("Scanning files...");
    let sync = build(config, root, &pb)?;
    let start = Instant::now();

    let result = match &output {
        Some(path) => sync.backup_to_file(&chain, path),
        None => sync.backup(&chain, BufWriter::new(io::stdout().lock())),
    };
    pb.finish_and_clear();

    // NoChanges surfaces as an error so scripts see a non-zero exit
    let report = result?;
    print_backup(&report, start.elapsed(), output.is_none());
    Ok(())
}

fn print_backup(report: &BackupReport, elapsed: Duration, to_stderr: bool) {
    let lines = vec![
        format!("{} Backup complete", "✓".green().bold()),
        format!("  Added: {}", report.stats.files_added.to_string().cyan()),
        format!("  Removed: {}", report.stats.files_removed.to_string().yellow()),
        format!("  Moved: {}", report.stats.files_moved.to_string().cyan()),
        format!(
            "  Archived: {} files, {}",
            report.files_archived.to_string().cyan(),
            format_bytes(report.bytes_archived).cyan()
        ),
        format!("  Chain: {} snapshot(s)", report.chain_length.to_string().cyan()),
        format!("  Time: {}", format_duration(round_ms(elapsed)).to_string().cyan()),
    ];
    emit(&lines, to_stderr);
    emit_warnings(&report.warnings, to_stderr);
}

/// Extract the archive and apply its latest diff
fn cmd_restore(config: SyncConfig, root: PathBuf, input: Option<PathBuf>) -> Result<()> {
    let pb = spinner("Restoring files...");
    let sync = build(config, root, &pb)?;

    let result = match &input {
        Some(path) => sync.restore_from_file(path),
        None => sync.restore(BufReader::new(io::stdin().lock())),
    };
    pb.finish_and_clear();

    print_restore(&result?);
    Ok(())
}

fn print_restore(report: &RestoreReport) {
    let date = report
        .snapshot_date
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "none".to_string());

    let lines = vec![
        format!("{} Restore complete", "✓".green().bold()),
        format!("  Snapshot: {}", date.yellow()),
        format!("  Removed: {}", report.files_removed.to_string().yellow()),
        format!("  Moved: {}", report.files_moved.to_string().cyan()),
        format!("  Restored: {}", report.files_restored.to_string().cyan()),
        format!("  Bytes written: {}", format_bytes(report.bytes_written).cyan()),
        format!(
            "  Time: {}",
            format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
        ),
    ];
    emit(&lines, false);
    emit_warnings(&report.warnings, false);
}

fn emit(lines: &[String], to_stderr: bool) {
    for line in lines {
        if to_stderr {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }
}

fn emit_warnings(warnings: &[String], to_stderr: bool) {
    if warnings.is_empty() {
        return;
    }
    let mut lines = vec![format!("\n{}", "Warnings:".yellow().bold())];
    lines.extend(warnings.iter().map(|w| format!("  - {}", w.yellow())));
    emit(&lines, to_stderr);
}

fn round_ms(elapsed: Duration) -> Duration {
    Duration::from_millis(elapsed.as_millis() as u64)
}
