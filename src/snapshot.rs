//! Directory snapshots: a content manifest of one hierarchy
//!
//! A [`Snapshot`] records a root directory, the digest algorithm used, and
//! one [`Metadata`] record per file below the root. The walk order is fixed
//! (within each directory, files first and then subdirectories, each group
//! sorted by name) so identical hierarchies always produce identical
//! manifests. Symlinks are never followed; they are fingerprinted by their
//! target text.
//!
//! Walking is sequential to keep that order; hashing runs in parallel on the
//! rayon global pool and results are collected back in walk order.

use crate::entry::Metadata;
use crate::error::{Result, XferError};
use crate::hasher::{self, DigestAlgorithm};
use crate::types::UnsupportedPolicy;
use crate::utils::make_relative;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::{self, FileType};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use walkdir::{DirEntry, WalkDir};

/// Current snapshot format version
pub const SNAPSHOT_VERSION: &str = "2";

/// Content manifest of one directory tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version
    pub version: String,
    /// Absolute root the manifest paths are relative to
    pub root: PathBuf,
    /// Algorithm every digest was computed with
    pub algorithm: DigestAlgorithm,
    /// One record per file, in walk order
    pub manifest: Vec<Metadata>,
}

/// How a tree is walked
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    /// Digest algorithm
    pub algorithm: DigestAlgorithm,
    /// What to do with sockets, FIFOs and devices
    pub unsupported_policy: UnsupportedPolicy,
}

impl Snapshot {
    /// Total number of bytes described by the manifest
    pub fn total_size(&self) -> u64 {
        self.manifest.iter().map(|m| m.size).sum()
    }

    /// Find the record for a relative path
    pub fn get(&self, name: &Path) -> Option<&Metadata> {
        self.manifest.iter().find(|m| m.name == name)
    }

    /// Render as pretty-printed JSON
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the snapshot as pretty JSON, replacing `path` atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json_pretty()?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let write_failed = |source| XferError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };
        let mut staged = tempfile::NamedTempFile::new_in(parent).map_err(write_failed)?;
        staged.write_all(json.as_bytes()).map_err(write_failed)?;
        staged.write_all(b"\n").map_err(write_failed)?;
        staged.as_file().sync_all().map_err(write_failed)?;
        staged.persist(path).map_err(|e| write_failed(e.error))?;

        debug!("Saved snapshot of {:?} to {:?}", self.root, path);
        Ok(())
    }

    /// Read a snapshot written by [`Snapshot::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(XferError::InvalidConfiguration(format!(
                "unsupported snapshot version '{}' in {:?}",
                snapshot.version, path
            )));
        }
        Ok(snapshot)
    }
}

/// Build a snapshot of `root` with default options
pub fn build_manifest(root: &Path) -> Result<Snapshot> {
    build_manifest_with(root, &SnapshotOptions::default())
}

/// Build a snapshot of `root`
///
/// # Errors
///
/// - [`XferError::UnsupportedFileType`] when the walk meets a socket, FIFO or
///   device and the policy is [`UnsupportedPolicy::Abort`]
/// - [`XferError::SourceUnavailable`] if a file cannot be read
/// - [`XferError::WalkDir`] if a directory cannot be listed
pub fn build_manifest_with(root: &Path, options: &SnapshotOptions) -> Result<Snapshot> {
    let start = Instant::now();
    let root = root.canonicalize().map_err(|source| XferError::SourceUnavailable {
        path: root.to_path_buf(),
        source,
    })?;

    let mut candidates: Vec<(PathBuf, FileType)> = Vec::new();
    for entry in WalkDir::new(&root)
        .follow_links(false)
        .min_depth(1)
        .sort_by(files_before_dirs)
    {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        trace!("PATH {:?}", entry.path());
        candidates.push((entry.path().to_path_buf(), entry.file_type()));
    }

    let records: Vec<Option<Metadata>> = candidates
        .par_iter()
        .map(|(path, file_type)| fingerprint(&root, path, *file_type, options))
        .collect::<Result<_>>()?;
    let manifest: Vec<Metadata> = records.into_iter().flatten().collect();

    info!(
        "Built manifest of {:?}: {} files in {:?}",
        root,
        manifest.len(),
        start.elapsed()
    );

    Ok(Snapshot {
        version: SNAPSHOT_VERSION.to_string(),
        root,
        algorithm: options.algorithm,
        manifest,
    })
}

/// Files (anything that is not a directory) sort ahead of subdirectories
fn files_before_dirs(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

fn fingerprint(
    root: &Path,
    path: &Path,
    file_type: FileType,
    options: &SnapshotOptions,
) -> Result<Option<Metadata>> {
    let fingerprinted = if file_type.is_file() {
        hasher::hash_file(path, options.algorithm)
    } else {
        hasher::digest(path, file_type, options.algorithm).and_then(|digest| {
            let size = fs::symlink_metadata(path)
                .map_err(|source| XferError::SourceUnavailable {
                    path: path.to_path_buf(),
                    source,
                })?
                .len();
            Ok((digest, size))
        })
    };

    // Regular files take their size from the bytes actually hashed
    let (digest, size) = match fingerprinted {
        Ok(fingerprint) => fingerprint,
        Err(XferError::UnsupportedFileType { path })
            if options.unsupported_policy == UnsupportedPolicy::Skip =>
        {
            warn!("Skipping unsupported file type: {:?}", path);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    Ok(Some(Metadata {
        name: make_relative(path, root)?,
        size,
        digest,
    }))
}
