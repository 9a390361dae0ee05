//! Core data types shared across the xfer library
//!
//! - **Planning**: [`PlanItem`], [`SyncPlan`], [`SessionTotals`]
//! - **Policies**: [`MismatchPolicy`], [`UnsupportedPolicy`]
//! - **Configuration**: [`SessionConfig`]
//! - **Execution**: [`SessionState`], [`SessionProgress`], [`SessionResult`],
//!   [`ProgressInfo`], [`CancelFlag`]

use crate::entry::{Metadata, SyncRequest, TransferDirection, TransferRequest, VerifyRequest, Entry};
use crate::error::{Result, XferError};
use crate::hasher::DigestAlgorithm;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What the session must do for one planned file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Copy from source to destination
    Transfer,
    /// Check the destination digest against the source, copying only on mismatch
    Verify,
}

/// One planned unit of work, with the source fingerprint it must match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    /// Transfer or verify
    pub kind: RequestKind,
    /// Source fingerprint (name, size, expected digest)
    pub source: Metadata,
}

impl PlanItem {
    /// Relative path of the planned file
    pub fn name(&self) -> &Path {
        &self.source.name
    }

    /// Size of the planned file
    pub fn size(&self) -> u64 {
        self.source.size
    }

    /// The request entry announcing this item
    pub fn request_entry(&self) -> Entry {
        let name = self.source.name.clone();
        let size = self.source.size;
        match self.kind {
            RequestKind::Transfer => TransferRequest { name, size }.into(),
            RequestKind::Verify => VerifyRequest { name, size }.into(),
        }
    }
}

/// Aggregate counters announced in the session header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTotals {
    /// Bytes planned for transfer
    pub bytes_to_transfer: u64,
    /// Files planned for transfer
    pub files_to_transfer: u64,
    /// Bytes planned for verification
    pub bytes_to_verify: u64,
    /// Files planned for verification
    pub files_to_verify: u64,
    /// Files in the source manifest
    pub files_at_source: u64,
}

impl SessionTotals {
    /// Read the baseline counters back out of a session header
    pub fn from_request(request: &SyncRequest) -> Self {
        Self {
            bytes_to_transfer: request.bytes_to_transfer,
            files_to_transfer: request.files_to_transfer,
            bytes_to_verify: request.bytes_to_verify,
            files_to_verify: request.files_to_verify,
            files_at_source: request.files_at_source,
        }
    }

    /// Total number of planned items
    pub fn planned_files(&self) -> u64 {
        self.files_to_transfer + self.files_to_verify
    }

    /// Total number of planned bytes
    pub fn planned_bytes(&self) -> u64 {
        self.bytes_to_transfer + self.bytes_to_verify
    }
}

/// Ordered work derived from a diff, plus its totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    /// Items in processing order
    pub items: Vec<PlanItem>,
    /// Totals for the session header
    pub totals: SessionTotals,
}

impl SyncPlan {
    /// Whether there is nothing to do
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// How a path whose metadata differs on both sides is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Plan a verification; re-transfer only after the mismatch is confirmed
    #[default]
    VerifyThenTransfer,
    /// Plan a transfer straight away
    AlwaysTransfer,
}

/// How the directory walk treats entries that are neither files nor symlinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedPolicy {
    /// Fail the whole walk
    #[default]
    Abort,
    /// Log a warning and leave the entry out of the manifest
    Skip,
}

/// Configuration of one sync session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Root of the source hierarchy
    pub source_root: PathBuf,
    /// Root of the destination hierarchy
    pub dest_root: PathBuf,
    /// Session log; an existing unfinished log is resumed
    pub log_path: PathBuf,
    /// Whether the local endpoint pulls or pushes
    #[serde(default)]
    pub direction: TransferDirection,
    /// Remote root announced in the header (defaults by direction)
    #[serde(default)]
    pub remote_prefix: Option<PathBuf>,
    /// Handling of differing files
    #[serde(default)]
    pub mismatch_policy: MismatchPolicy,
    /// Handling of unsupported file types during the walk
    #[serde(default)]
    pub unsupported_policy: UnsupportedPolicy,
    /// Digest algorithm for a fresh session
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,
    /// Parallel workers for the active phase (1 = sequential)
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    1
}

impl SessionConfig {
    /// Remote root for the header: the source when pulling, the destination when pushing
    pub fn remote_prefix(&self) -> PathBuf {
        if let Some(prefix) = &self.remote_prefix {
            return prefix.clone();
        }
        match self.direction {
            TransferDirection::Pull => self.source_root.clone(),
            TransferDirection::Push => self.dest_root.clone(),
        }
    }

    /// Check the configuration before a session starts
    pub fn validate(&self) -> Result<()> {
        if !self.source_root.is_dir() {
            return Err(XferError::InvalidConfiguration(format!(
                "source root {:?} is not a directory",
                self.source_root
            )));
        }
        if self.dest_root.exists() && !self.dest_root.is_dir() {
            return Err(XferError::InvalidConfiguration(format!(
                "destination root {:?} exists and is not a directory",
                self.dest_root
            )));
        }
        if self.source_root == self.dest_root {
            return Err(XferError::InvalidConfiguration(
                "source and destination roots must differ".to_string(),
            ));
        }
        if self.log_path.as_os_str().is_empty() {
            return Err(XferError::InvalidConfiguration("log path is empty".to_string()));
        }
        if self.workers == 0 {
            return Err(XferError::InvalidConfiguration("workers must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        let config: SessionConfig = serde_json::from_slice(&content)?;
        Ok(config)
    }
}

/// States of the sync state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Diffing manifests and computing totals
    Planning,
    /// Header written, baseline counters fixed
    Announced,
    /// Executing planned items
    Active,
    /// Every planned item complete and `SyncDone` written
    Completed,
    /// Stopped on the first unrecovered failure; the log is resumable
    Interrupted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Planning => "planning",
            SessionState::Announced => "announced",
            SessionState::Active => "active",
            SessionState::Completed => "completed",
            SessionState::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Running counters of finished work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProgress {
    /// Transfer requests completed
    pub files_transferred: u64,
    /// Bytes of completed transfer requests
    pub bytes_transferred: u64,
    /// Verify requests completed
    pub files_verified: u64,
    /// Bytes of completed verify requests
    pub bytes_verified: u64,
    /// Verify requests whose mismatch forced a copy
    pub files_retransferred: u64,
}

impl SessionProgress {
    /// Items completed of either kind
    pub fn files_done(&self) -> u64 {
        self.files_transferred + self.files_verified
    }

    /// Bytes completed of either kind
    pub fn bytes_done(&self) -> u64 {
        self.bytes_transferred + self.bytes_verified
    }
}

/// Outcome of one call to `run_sync`
#[derive(Debug)]
pub struct SessionResult {
    /// `Completed` or `Interrupted`
    pub state: SessionState,
    /// Baseline counters from the header
    pub totals: SessionTotals,
    /// Completed work, including work re-derived from the log on resume
    pub progress: SessionProgress,
    /// Items skipped because the log already recorded them as complete
    pub skipped: u64,
    /// Whether an existing log was resumed
    pub resumed: bool,
    /// First unrecovered error, when interrupted
    pub failure: Option<XferError>,
    /// Wall time of this call in milliseconds
    pub duration_ms: u64,
}

impl SessionResult {
    /// Whether the session reached `Completed`
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Completed
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: u64,
    /// Total items to process
    pub total: u64,
    /// Bytes processed so far
    pub bytes_processed: u64,
    /// Total bytes to process
    pub total_bytes: u64,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        if self.total > 0 {
            Some((self.processed as f32 / self.total as f32) * 100.0)
        } else {
            None
        }
    }
}

/// Cooperative cancellation shared between a session and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop before its next item
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
