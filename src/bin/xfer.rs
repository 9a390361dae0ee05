//! # xfer CLI - Manifest-driven directory synchronization
//!
//! Command-line front end for the xfer library.
//!
//! ## Usage
//! ```bash
//! # Print a snapshot of a directory as JSON
//! xfer make ./photos -o photos.json
//!
//! # Compare two snapshots
//! xfer compare photos.json backup.json
//!
//! # Synchronize (re-running with the same log resumes)
//! xfer sync --source ./photos --dest /mnt/backup/photos --log photos.log
//!
//! # Summarize a session log
//! xfer log photos.log
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use xfer::utils::{format_bytes, format_timestamp};
use xfer::{
    build_manifest_with, diff, replay, DigestAlgorithm, MismatchPolicy, ProgressInfo,
    SessionBuilder, SessionConfig, SessionResult, SessionState, Snapshot, SnapshotOptions,
    TransferDirection, UnsupportedPolicy,
};

/// xfer CLI - Synchronize directory trees through verifiable manifests
#[derive(Parser)]
#[command(name = "xfer")]
#[command(version)]
#[command(about = "Manifest-driven file synchronization with atomic, hash-verified transfers")]
#[command(long_about = None)]
struct Cli {
    /// Log debugging messages to standard error
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot a directory and print or save it as JSON
    Make {
        /// Directory to snapshot
        dir: PathBuf,

        /// Write the snapshot to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Digest algorithm
        #[arg(long, value_enum, default_value = "sha512")]
        algorithm: AlgorithmArg,

        /// Skip sockets, FIFOs and devices instead of failing
        #[arg(long)]
        skip_unsupported: bool,
    },

    /// Print the differences between two snapshots
    Compare {
        /// First snapshot file
        s1: PathBuf,

        /// Second snapshot file
        s2: PathBuf,
    },

    /// Synchronize a destination tree with a source tree
    Sync {
        /// Source directory
        #[arg(long, required_unless_present = "config")]
        source: Option<PathBuf>,

        /// Destination directory
        #[arg(long, required_unless_present = "config")]
        dest: Option<PathBuf>,

        /// Session log; an unfinished log is resumed
        #[arg(long, required_unless_present = "config")]
        log: Option<PathBuf>,

        /// Whether this endpoint pulls or pushes
        #[arg(long, value_enum, default_value = "pull")]
        direction: DirectionArg,

        /// Handling of files that differ on both sides
        #[arg(long, value_enum, default_value = "verify")]
        policy: PolicyArg,

        /// Parallel workers: a number or "auto"
        #[arg(long, default_value = "1")]
        workers: String,

        /// Digest algorithm for a fresh session
        #[arg(long, value_enum, default_value = "sha512")]
        algorithm: AlgorithmArg,

        /// Skip sockets, FIFOs and devices instead of failing
        #[arg(long)]
        skip_unsupported: bool,

        /// Load the session configuration from a JSON file
        #[arg(long, conflicts_with_all = ["source", "dest", "log"])]
        config: Option<PathBuf>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Summarize a session log
    Log {
        /// Session log file
        file: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum AlgorithmArg {
    Sha256,
    Sha512,
}

impl From<AlgorithmArg> for DigestAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Sha256 => DigestAlgorithm::Sha256,
            AlgorithmArg::Sha512 => DigestAlgorithm::Sha512,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum DirectionArg {
    Pull,
    Push,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// Verify differing files and copy only confirmed mismatches
    Verify,
    /// Copy differing files without verifying first
    Always,
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Main command runner, returning the process exit code
fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Make {
            dir,
            output,
            algorithm,
            skip_unsupported,
        } => cmd_make(&dir, output.as_deref(), algorithm.into(), skip_unsupported).map(|_| 0),
        Commands::Compare { s1, s2 } => cmd_compare(&s1, &s2).map(|_| 0),
        Commands::Sync {
            source,
            dest,
            log,
            direction,
            policy,
            workers,
            algorithm,
            skip_unsupported,
            config,
            progress,
        } => {
            let config = match config {
                Some(path) => SessionConfig::load(&path)
                    .with_context(|| format!("failed to load configuration {}", path.display()))?,
                None => SessionConfig {
                    source_root: source.context("--source is required")?,
                    dest_root: dest.context("--dest is required")?,
                    log_path: log.context("--log is required")?,
                    direction: match direction {
                        DirectionArg::Pull => TransferDirection::Pull,
                        DirectionArg::Push => TransferDirection::Push,
                    },
                    remote_prefix: None,
                    mismatch_policy: match policy {
                        PolicyArg::Verify => MismatchPolicy::VerifyThenTransfer,
                        PolicyArg::Always => MismatchPolicy::AlwaysTransfer,
                    },
                    unsupported_policy: unsupported(skip_unsupported),
                    digest_algorithm: algorithm.into(),
                    workers: parse_workers(&workers)?,
                },
            };
            cmd_sync(config, progress)
        }
        Commands::Log { file } => cmd_log(&file).map(|_| 0),
    }
}

fn unsupported(skip: bool) -> UnsupportedPolicy {
    if skip {
        UnsupportedPolicy::Skip
    } else {
        UnsupportedPolicy::Abort
    }
}

fn parse_workers(value: &str) -> Result<usize> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(num_cpus::get());
    }
    let workers: usize = value
        .parse()
        .with_context(|| format!("invalid worker count '{}'", value))?;
    Ok(workers.max(1))
}

/// Snapshot a directory
fn cmd_make(dir: &Path, output: Option<&Path>, algorithm: DigestAlgorithm, skip: bool) -> Result<()> {
    let options = SnapshotOptions {
        algorithm,
        unsupported_policy: unsupported(skip),
    };
    let snapshot = build_manifest_with(dir, &options)
        .with_context(|| format!("failed to snapshot {}", dir.display()))?;

    match output {
        Some(path) => {
            snapshot
                .save(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "{} Snapshot of {} ({} files, {}) saved to {}",
                "✓".green().bold(),
                snapshot.root.display().to_string().cyan(),
                snapshot.manifest.len(),
                format_bytes(snapshot.total_size()),
                path.display()
            );
        }
        None => println!("{}", snapshot.to_json_pretty()?),
    }
    Ok(())
}

/// Compare two snapshot files
fn cmd_compare(s1: &Path, s2: &Path) -> Result<()> {
    let a = Snapshot::load(s1).with_context(|| format!("failed to load snapshot {}", s1.display()))?;
    let b = Snapshot::load(s2).with_context(|| format!("failed to load snapshot {}", s2.display()))?;

    let result = diff(&a, &b)?;
    for line in result.report_lines(&a.root, &b.root) {
        println!("{}", line);
    }
    Ok(())
}

/// Run or resume a sync session
fn cmd_sync(config: SessionConfig, show_progress: bool) -> Result<i32> {
    println!("{}", "Synchronizing...".blue().bold());
    println!("  Source: {}", config.source_root.display().to_string().cyan());
    println!("  Dest:   {}", config.dest_root.display().to_string().cyan());
    println!("  Log:    {}", config.log_path.display().to_string().cyan());

    let start = Instant::now();
    let mut builder = SessionBuilder::from_config(&config);
    let pb = if show_progress {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        let bar = pb.clone();
        builder = builder.progress_callback(Arc::new(move |info: ProgressInfo| {
            bar.set_length(info.total);
            bar.set_position(info.processed);
            if let Some(item) = info.current_item {
                bar.set_message(item);
            }
        }));
        Some(pb)
    } else {
        None
    };

    let mut session = builder.build(config.source_root, config.dest_root, config.log_path)?;
    let result = session.run();
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let result = result?;

    print_summary(&result, start.elapsed());
    Ok(if result.is_complete() { 0 } else { 1 })
}

fn print_summary(result: &SessionResult, elapsed: Duration) {
    match result.state {
        SessionState::Completed => println!("{} Sync completed", "✓".green().bold()),
        _ => println!("{} Sync {}", "✗".red().bold(), result.state.to_string().red()),
    }
    if result.resumed {
        println!("  Resumed: {} items already complete", result.skipped.to_string().yellow());
    }

    let totals = &result.totals;
    let progress = &result.progress;
    println!(
        "  Transferred: {}/{} files ({} of {})",
        progress.files_transferred.to_string().cyan(),
        totals.files_to_transfer,
        format_bytes(progress.bytes_transferred),
        format_bytes(totals.bytes_to_transfer)
    );
    println!(
        "  Verified: {}/{} files ({} of {})",
        progress.files_verified.to_string().cyan(),
        totals.files_to_verify,
        format_bytes(progress.bytes_verified),
        format_bytes(totals.bytes_to_verify)
    );
    if progress.files_retransferred > 0 {
        println!(
            "  Re-transferred after mismatch: {}",
            progress.files_retransferred.to_string().yellow()
        );
    }
    println!("  Files at source: {}", totals.files_at_source);
    println!("  Time: {}", format_duration(round_to_millis(elapsed)).to_string().cyan());

    if let Some(failure) = &result.failure {
        println!("  {}: {}", "Failure".red().bold(), failure.user_message());
        println!("  Run the same command again to resume.");
    }
}

fn round_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

/// Print a summary of a session log
fn cmd_log(file: &Path) -> Result<()> {
    let log = replay(file).with_context(|| format!("failed to read log {}", file.display()))?;

    let Some(request) = &log.request else {
        println!("{} {} holds no session", "!".yellow().bold(), file.display());
        return Ok(());
    };

    println!("{}", "Session".blue().bold());
    println!("  Direction: {} {}", request.direction, request.remote_prefix.display());
    println!("  Started: {}", format_timestamp(request.timestamp));
    println!("  Digest: {}", request.digest_algorithm);
    println!(
        "  Planned: {} transfers ({}), {} verifications ({})",
        request.files_to_transfer,
        format_bytes(request.bytes_to_transfer),
        request.files_to_verify,
        format_bytes(request.bytes_to_verify)
    );
    println!(
        "  Completed: {}/{}",
        log.completed.len().to_string().cyan(),
        log.planned.len()
    );

    match &log.done {
        Some(done) => println!(
            "  {} Sealed at {}",
            "✓".green().bold(),
            format_timestamp(done.timestamp)
        ),
        None => println!("  {} Interrupted; resumable", "!".yellow().bold()),
    }
    Ok(())
}
