//! The sync session state machine
//!
//! A session moves through `Planning → Announced → Active → Completed`, or
//! stops in `Interrupted` on the first unrecovered failure. Everything it
//! decides is written to the session log before it acts on it:
//!
//! ```text
//! # xfer session started 2024-01-01T00:00:00+00:00
//! SYNC_REQUEST {...totals...}
//! METADATA {"name":"a.txt","size":3,"digest":"..."}
//! TRANSFER_REQUEST {"name":"a.txt","size":3}
//! METADATA {"name":"b.txt","size":5,"digest":"..."}
//! VERIFY_REQUEST {"name":"b.txt","size":5}
//! TRANSFER_COMPLETE {"name":"b.txt","size":5,"digest":"...","timestamp":...}
//! TRANSFER_COMPLETE {"name":"a.txt","size":3,"digest":"...","timestamp":...}
//! SYNC_DONE {"timestamp":...}
//! ```
//!
//! The recorded `METADATA` is the source fingerprint each request must
//! match, so an interrupted session can be resumed from its log alone:
//! completions are matched to requests by name and size, and the rest of
//! the plan is executed again.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use xfer::{SessionBuilder, MismatchPolicy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = SessionBuilder::new()
//!     .mismatch_policy(MismatchPolicy::VerifyThenTransfer)
//!     .workers(4)
//!     .build("source".into(), "dest".into(), "sync.log".into())?;
//!
//! let result = session.run()?;
//! println!("{}: {} files done", result.state, result.progress.files_done());
//! # Ok(())
//! # }
//! ```

use crate::copier::copy_entry;
use crate::diff::diff;
use crate::entry::{Entry, Metadata, SyncDone, SyncRequest, TransferComplete, TransferDirection};
use crate::error::{Result, XferError};
use crate::hasher::{self, DigestAlgorithm};
use crate::manifest::{replay, LogReplay, ManifestWriter};
use crate::snapshot::{build_manifest_with, Snapshot, SnapshotOptions};
use crate::types::{
    CancelFlag, MismatchPolicy, PlanItem, ProgressCallback, ProgressInfo, RequestKind,
    SessionConfig, SessionProgress, SessionResult, SessionState, SessionTotals, SyncPlan,
    UnsupportedPolicy,
};
use crate::utils::{
    ensure_dir_under, ensure_parent_dir, format_bytes, format_timestamp, is_safe_relative,
    unix_timestamp,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Run one sync session described by `config`, resuming its log if unfinished
///
/// Failures during planning are returned as errors. Failures once the
/// session has been announced leave it `Interrupted` and are reported in
/// [`SessionResult::failure`], because the log is then the durable record
/// of progress.
pub fn run_sync(config: SessionConfig) -> Result<SessionResult> {
    SyncSession::new(config)?.run()
}

/// Builder for configuring a [`SyncSession`]
#[derive(Clone)]
pub struct SessionBuilder {
    direction: TransferDirection,
    remote_prefix: Option<PathBuf>,
    mismatch_policy: MismatchPolicy,
    unsupported_policy: UnsupportedPolicy,
    digest_algorithm: DigestAlgorithm,
    workers: usize,
    cancel: Option<CancelFlag>,
    progress: Option<ProgressCallback>,
}

impl SessionBuilder {
    /// Create a builder with default settings
    ///
    /// Pull direction, verify-then-transfer, abort on unsupported file types,
    /// SHA-512, one worker.
    pub fn new() -> Self {
        Self {
            direction: TransferDirection::default(),
            remote_prefix: None,
            mismatch_policy: MismatchPolicy::default(),
            unsupported_policy: UnsupportedPolicy::default(),
            digest_algorithm: DigestAlgorithm::default(),
            workers: 1,
            cancel: None,
            progress: None,
        }
    }

    /// Start from the options of an existing configuration
    ///
    /// The roots and log path are still passed to [`SessionBuilder::build`].
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            direction: config.direction,
            remote_prefix: config.remote_prefix.clone(),
            mismatch_policy: config.mismatch_policy,
            unsupported_policy: config.unsupported_policy,
            digest_algorithm: config.digest_algorithm,
            workers: config.workers.max(1),
            cancel: None,
            progress: None,
        }
    }

    /// Set whether the local endpoint pulls or pushes
    pub fn direction(mut self, direction: TransferDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Override the remote root announced in the session header
    pub fn remote_prefix(mut self, prefix: PathBuf) -> Self {
        self.remote_prefix = Some(prefix);
        self
    }

    /// Set how files that differ on both sides are handled
    pub fn mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.mismatch_policy = policy;
        self
    }

    /// Set how sockets, FIFOs and devices met during the walk are handled
    pub fn unsupported_policy(mut self, policy: UnsupportedPolicy) -> Self {
        self.unsupported_policy = policy;
        self
    }

    /// Set the digest algorithm for a fresh session
    ///
    /// A resumed session always uses the algorithm recorded in its log.
    pub fn digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    /// Set the number of parallel workers for the active phase
    ///
    /// Zero is treated as one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Attach a cancellation flag checked before each planned item
    pub fn cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Attach a callback invoked after each completed item
    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Build the session
    ///
    /// # Errors
    ///
    /// - [`XferError::InvalidConfiguration`] if the source root is not a
    ///   directory or both roots are the same
    pub fn build(self, source_root: PathBuf, dest_root: PathBuf, log_path: PathBuf) -> Result<SyncSession> {
        let config = SessionConfig {
            source_root,
            dest_root,
            log_path,
            direction: self.direction,
            remote_prefix: self.remote_prefix,
            mismatch_policy: self.mismatch_policy,
            unsupported_policy: self.unsupported_policy,
            digest_algorithm: self.digest_algorithm,
            workers: self.workers,
        };
        let mut session = SyncSession::new(config)?;
        if let Some(flag) = self.cancel {
            session.cancel = flag;
        }
        session.progress = self.progress;
        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One synchronization run between two directory trees
pub struct SyncSession {
    config: SessionConfig,
    state: SessionState,
    cancel: CancelFlag,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// What the active phase needs, fixed once the session is announced
struct ActivePhase {
    writer: ManifestWriter,
    algorithm: DigestAlgorithm,
    totals: SessionTotals,
    pending: Vec<PlanItem>,
    progress: SessionProgress,
    skipped: u64,
    resumed: bool,
}

impl SyncSession {
    /// Create a session from a validated configuration
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: SessionState::Planning,
            cancel: CancelFlag::new(),
            progress: None,
        })
    }

    /// The configuration this session runs with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state of the state machine
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// A handle that cancels this session from another thread
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn transition(&mut self, next: SessionState) {
        info!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    /// Execute the session to completion or interruption
    ///
    /// An existing log with a header is resumed; a sealed log is reported
    /// as completed without touching anything.
    pub fn run(&mut self) -> Result<SessionResult> {
        let start = Instant::now();
        self.state = SessionState::Planning;

        let existing = self.existing_log()?;
        let phase = match existing {
            Some(log) if log.request.is_some() => match self.resume(log)? {
                Resumption::Sealed(result) => return Ok(self.finish(result, start)),
                Resumption::Rejected(result) => return Ok(self.finish(result, start)),
                Resumption::Continue(phase) => phase,
            },
            _ => self.announce()?,
        };

        Ok(self.execute(phase, start))
    }

    fn existing_log(&self) -> Result<Option<LogReplay>> {
        match fs::metadata(&self.config.log_path) {
            Ok(meta) if meta.len() > 0 => {
                debug!("Replaying existing log {:?}", self.config.log_path);
                replay(&self.config.log_path).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn finish(&mut self, mut result: SessionResult, start: Instant) -> SessionResult {
        if result.state != self.state {
            self.transition(result.state);
        }
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Plan from fresh manifests and write the session header
    fn announce(&mut self) -> Result<ActivePhase> {
        let config = &self.config;
        let options = SnapshotOptions {
            algorithm: config.digest_algorithm,
            unsupported_policy: config.unsupported_policy,
        };

        if !config.dest_root.exists() {
            fs::create_dir_all(&config.dest_root).map_err(|source| XferError::WriteFailed {
                path: config.dest_root.clone(),
                source,
            })?;
        }

        let source = build_manifest_with(&config.source_root, &options)?;
        let dest = build_manifest_with(&config.dest_root, &options)?;
        let result = diff(&source, &dest)?;
        if !result.only_in_dest.is_empty() {
            info!(
                "{} files exist only at the destination and are left untouched",
                result.only_in_dest.len()
            );
        }
        let plan = result.plan(&source, config.mismatch_policy);
        let algorithm = source.algorithm;

        let writer = self.write_header(&source, &plan)?;
        self.transition(SessionState::Announced);

        Ok(ActivePhase {
            writer,
            algorithm,
            totals: plan.totals,
            pending: plan.items,
            progress: SessionProgress::default(),
            skipped: 0,
            resumed: false,
        })
    }

    fn write_header(&self, source: &Snapshot, plan: &SyncPlan) -> Result<ManifestWriter> {
        let config = &self.config;
        ensure_parent_dir(&config.log_path)?;
        let writer = ManifestWriter::create(&config.log_path)?;
        let now = unix_timestamp();

        writer.write_comment(&format!("xfer session started {}", format_timestamp(now)))?;
        let totals = plan.totals;
        writer.write_entry(
            &SyncRequest {
                direction: config.direction,
                timestamp: now,
                bytes_to_verify: totals.bytes_to_verify,
                files_to_verify: totals.files_to_verify,
                remote_prefix: config.remote_prefix(),
                bytes_to_transfer: totals.bytes_to_transfer,
                files_to_transfer: totals.files_to_transfer,
                files_at_source: totals.files_at_source,
                digest_algorithm: source.algorithm,
            }
            .into(),
        )?;

        for item in &plan.items {
            writer.write_entry(&item.source.clone().into())?;
            writer.write_entry(&item.request_entry())?;
        }

        info!(
            "Announced {} transfers ({}) and {} verifications ({})",
            totals.files_to_transfer,
            format_bytes(totals.bytes_to_transfer),
            totals.files_to_verify,
            format_bytes(totals.bytes_to_verify)
        );
        Ok(writer)
    }

    /// Rebuild the session from an unfinished or sealed log
    fn resume(&mut self, log: LogReplay) -> Result<Resumption> {
        let request = match &log.request {
            Some(request) => request.clone(),
            None => return Err(XferError::internal("resume without a session header")),
        };
        let totals = SessionTotals::from_request(&request);
        let algorithm = request.digest_algorithm;
        if algorithm != self.config.digest_algorithm {
            debug!(
                "Log records {} digests; ignoring configured {}",
                algorithm, self.config.digest_algorithm
            );
        }

        let announced = log.planned.len() as u64;
        if announced != totals.planned_files() {
            if log.completed.is_empty() && !log.is_sealed() {
                warn!(
                    "Log announces {} of {} planned items; planning again",
                    announced,
                    totals.planned_files()
                );
                return self.announce().map(Resumption::Continue);
            }
            return Err(XferError::invalid_log(format!(
                "header plans {} items but {} were announced",
                totals.planned_files(),
                announced
            )));
        }

        let mut progress = SessionProgress::default();
        let mut done: HashSet<PathBuf> = HashSet::new();
        let mut violation = None;

        for complete in &log.completed {
            let Some(item) = log
                .planned
                .iter()
                .find(|i| i.name() == complete.name && i.size() == complete.size)
            else {
                return Err(XferError::invalid_log(format!(
                    "completion for {:?} ({} bytes) matches no planned request",
                    complete.name, complete.size
                )));
            };
            if complete.digest != item.source.digest {
                violation = Some(XferError::IntegrityViolation {
                    path: complete.name.clone(),
                    expected: item.source.digest.clone(),
                    actual: complete.digest.clone(),
                });
                break;
            }
            if done.insert(complete.name.clone()) {
                record_progress(&mut progress, item.kind, item.size(), false);
            }
        }

        let skipped = done.len() as u64;
        if let Some(failure) = violation {
            warn!("Refusing to resume: {}", failure);
            return Ok(Resumption::Rejected(SessionResult {
                state: SessionState::Interrupted,
                totals,
                progress,
                skipped,
                resumed: true,
                failure: Some(failure),
                duration_ms: 0,
            }));
        }

        if log.is_sealed() {
            info!("Log {:?} is already sealed", self.config.log_path);
            return Ok(Resumption::Sealed(SessionResult {
                state: SessionState::Completed,
                totals,
                progress,
                skipped,
                resumed: true,
                failure: None,
                duration_ms: 0,
            }));
        }

        let pending: Vec<PlanItem> = log
            .planned
            .into_iter()
            .filter(|item| !done.contains(item.name()))
            .collect();
        info!(
            "Resuming {:?}: {} items already complete, {} remaining",
            self.config.log_path,
            skipped,
            pending.len()
        );

        let writer = ManifestWriter::resume(&self.config.log_path, log.valid_len)?;
        self.transition(SessionState::Announced);

        Ok(Resumption::Continue(ActivePhase {
            writer,
            algorithm,
            totals,
            pending,
            progress,
            skipped,
            resumed: true,
        }))
    }

    /// Run every pending item, then seal the log
    fn execute(&mut self, phase: ActivePhase, start: Instant) -> SessionResult {
        self.transition(SessionState::Active);
        let ActivePhase {
            writer,
            algorithm,
            totals,
            pending,
            progress,
            skipped,
            resumed,
        } = phase;

        let progress = Mutex::new(progress);
        let worker = ItemWorker {
            source_root: &self.config.source_root,
            dest_root: &self.config.dest_root,
            algorithm,
            writer: &writer,
            progress: &progress,
            totals,
            cancel: &self.cancel,
            callback: self.progress.as_ref(),
        };

        let outcome = if self.config.workers > 1 && pending.len() > 1 {
            run_parallel(&worker, &pending, self.config.workers)
        } else {
            pending.iter().try_for_each(|item| worker.process(item))
        };

        let outcome = outcome.and_then(|_| {
            writer.write_entry(&SyncDone::now().into())?;
            Ok(())
        });

        let progress = progress.into_inner();
        let (state, failure) = match outcome {
            Ok(()) => {
                info!(
                    "Sync complete: {} transferred, {} verified ({} re-transferred)",
                    progress.files_transferred, progress.files_verified, progress.files_retransferred
                );
                (SessionState::Completed, None)
            }
            Err(e) => {
                warn!("Sync interrupted: {}", e);
                (SessionState::Interrupted, Some(e))
            }
        };

        self.finish(
            SessionResult {
                state,
                totals,
                progress,
                skipped,
                resumed,
                failure,
                duration_ms: 0,
            },
            start,
        )
    }
}

enum Resumption {
    Continue(ActivePhase),
    Sealed(SessionResult),
    Rejected(SessionResult),
}

fn run_parallel(worker: &ItemWorker<'_>, pending: &[PlanItem], workers: usize) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| XferError::internal(format!("failed to start worker pool: {}", e)))?;
    debug!("Processing {} items on {} workers", pending.len(), workers);
    pool.install(|| pending.par_iter().try_for_each(|item| worker.process(item)))
}

fn record_progress(progress: &mut SessionProgress, kind: RequestKind, size: u64, retransferred: bool) {
    match kind {
        RequestKind::Transfer => {
            progress.files_transferred += 1;
            progress.bytes_transferred += size;
        }
        RequestKind::Verify => {
            progress.files_verified += 1;
            progress.bytes_verified += size;
            if retransferred {
                progress.files_retransferred += 1;
            }
        }
    }
}

/// Per-item work shared by every worker thread
struct ItemWorker<'a> {
    source_root: &'a Path,
    dest_root: &'a Path,
    algorithm: DigestAlgorithm,
    writer: &'a ManifestWriter,
    progress: &'a Mutex<SessionProgress>,
    totals: SessionTotals,
    cancel: &'a CancelFlag,
    callback: Option<&'a ProgressCallback>,
}

impl ItemWorker<'_> {
    fn process(&self, item: &PlanItem) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(XferError::Cancelled);
        }
        if !is_safe_relative(item.name()) {
            return Err(XferError::invalid_log(format!(
                "refusing path outside the hierarchy root: {:?}",
                item.name()
            )));
        }

        let source = self.source_root.join(item.name());
        let dest = ensure_dir_under(self.dest_root, item.name())?;

        let (digest, size, retransferred) = match item.kind {
            RequestKind::Transfer => {
                let (digest, size) = self.copy(&item.source, &source, &dest)?;
                (digest, size, false)
            }
            RequestKind::Verify => match self.dest_digest(&dest)? {
                Some(digest) if digest == item.source.digest => {
                    trace!("Verified {:?}", item.name());
                    (digest, item.size(), false)
                }
                observed => {
                    warn!(
                        "Digest mismatch for {:?} (expected {}, found {}); re-transferring",
                        item.name(),
                        item.source.digest,
                        observed.as_deref().unwrap_or("nothing")
                    );
                    let (digest, size) = self.copy(&item.source, &source, &dest)?;
                    (digest, size, true)
                }
            },
        };

        let complete: Entry = TransferComplete::now(item.name(), size, digest).into();
        self.writer.write_entry(&complete)?;

        let snapshot = {
            let mut progress = self.progress.lock();
            record_progress(&mut progress, item.kind, item.size(), retransferred);
            *progress
        };
        debug!("Completed {:?} ({} of {})", item.name(), snapshot.files_done(), self.totals.planned_files());

        if let Some(callback) = self.callback {
            callback(ProgressInfo {
                operation: match item.kind {
                    RequestKind::Transfer => "Transferring".to_string(),
                    RequestKind::Verify => "Verifying".to_string(),
                },
                current_item: Some(item.name().display().to_string()),
                processed: snapshot.files_done(),
                total: self.totals.planned_files(),
                bytes_processed: snapshot.bytes_done(),
                total_bytes: self.totals.planned_bytes(),
            });
        }
        Ok(())
    }

    fn copy(&self, expected: &Metadata, source: &Path, dest: &Path) -> Result<(String, u64)> {
        copy_entry(source, dest, self.algorithm, Some(expected))
    }

    /// Digest of whatever is at `dest`, or `None` when nothing is there
    fn dest_digest(&self, dest: &Path) -> Result<Option<String>> {
        match fs::symlink_metadata(dest) {
            Ok(meta) => hasher::digest(dest, meta.file_type(), self.algorithm).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(XferError::SourceUnavailable {
                path: dest.to_path_buf(),
                source,
            }),
        }
    }
}
