//! # xfer - Manifest-driven file hierarchy synchronization
//!
//! Synchronizes a destination directory tree with a source tree by comparing
//! content manifests and driving every transfer, verification and completion
//! through an append-only session log.
//!
//! ## Overview
//!
//! xfer is built around a small, typed, line-oriented protocol:
//! - Directory trees are fingerprinted into manifests of `(path, size, digest)`
//! - Two manifests are diffed into source-only, destination-only and differing paths
//! - A sync session announces its plan, copies or verifies each file, and records
//!   every success as one log line
//! - Every copy is atomic: a destination file is either the old one or the fully
//!   written, digest-checked new one
//! - An interrupted session resumes from its log without redoing finished work
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xfer::{run_sync, SessionConfig, SessionState};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config: SessionConfig = serde_json::from_str(r#"{
//!     "source_root": "./photos",
//!     "dest_root": "/mnt/backup/photos",
//!     "log_path": "./photos-sync.log"
//! }"#)?;
//!
//! let result = run_sync(config)?;
//! match result.state {
//!     SessionState::Completed => println!("{} files synchronized", result.progress.files_done()),
//!     _ => println!("Interrupted: {:?}; run again to resume", result.failure),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Comparing Trees
//!
//! ```rust,no_run
//! use xfer::{build_manifest, diff};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let left = build_manifest(Path::new("left"))?;
//! let right = build_manifest(Path::new("right"))?;
//! for line in diff(&left, &right)?.report_lines(&left.root, &right.root) {
//!     println!("{}", line);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Entries
//!
//! Every record is one line: an uppercase tag derived from the record type
//! followed by a JSON payload, e.g.
//! `TRANSFER_REQUEST {"name":"a.txt","size":3}`. Lines starting with `#` and
//! blank lines are comments.
//!
//! ### Session log
//!
//! A session log starts with `SYNC_REQUEST` (the plan's totals), lists the
//! source fingerprint and request for every planned file, records a
//! `TRANSFER_COMPLETE` per finished file and ends with `SYNC_DONE`. A log
//! without `SYNC_DONE` belongs to an interrupted session.
//!
//! ### Digests
//!
//! Digests depend on content only. Regular files hash their bytes; symlinks
//! hash their target text and are never followed. Manifests record their
//! digest algorithm and are only compared with manifests of the same one.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, XferError>`. I/O failures are wrapped at
//! the component that saw them, so a missing source (`SourceUnavailable`), a
//! failed destination write (`WriteFailed`), a corrupt log (`MalformedEntry`,
//! `InvalidLog`) and tampered data (`IntegrityViolation`) stay distinguishable.
//!
//! ## Module Organization
//!
//! - [`hasher`]: Streaming content digests
//! - [`entry`]: Typed log entries and their line encoding
//! - [`manifest`]: Lazy log reader, append-only writer and replay
//! - [`copier`]: Atomic, hash-verified copies
//! - [`snapshot`]: Directory-tree manifests
//! - [`diff`]: Manifest comparison and sync planning
//! - [`session`]: The sync session state machine
//! - [`types`]: Configuration, plan and result types
//! - [`error`]: Error types and handling

// Public API modules
pub mod copier;
pub mod diff;
pub mod entry;
pub mod error;
pub mod hasher;
pub mod manifest;
pub mod session;
pub mod snapshot;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use copier::{copy_entry, copy_with_hash};
pub use diff::{diff, DiffResult};
pub use entry::{
    Entry, FileInfo, Metadata, SyncDone, SyncRequest, TransferComplete, TransferDirection,
    TransferRequest, VerifyRequest,
};
pub use error::{Result, XferError};
pub use hasher::{hash_bytes, hash_file, DigestAlgorithm};
pub use manifest::{read_manifest, replay, LogReplay, ManifestReader, ManifestWriter};
pub use session::{run_sync, SessionBuilder, SyncSession};
pub use snapshot::{build_manifest, build_manifest_with, Snapshot, SnapshotOptions};
pub use types::*;
