//! Manifest comparison and sync planning
//!
//! [`diff`] classifies every path of two snapshots into one of three
//! disjoint sets: present only on the left, present only on the right, or
//! present on both sides with unequal [`Metadata`]. Comparison is keyed by
//! relative path and does not depend on manifest order; the sets themselves
//! iterate lexicographically so reports and plans are deterministic.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use xfer::diff::diff;
//! use xfer::snapshot::build_manifest;
//! use xfer::types::MismatchPolicy;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = build_manifest(Path::new("src_tree"))?;
//! let dest = build_manifest(Path::new("dest_tree"))?;
//!
//! let result = diff(&source, &dest)?;
//! for line in result.report_lines(&source.root, &dest.root) {
//!     println!("{}", line);
//! }
//!
//! let plan = result.plan(&source, MismatchPolicy::VerifyThenTransfer);
//! println!("{} files to transfer", plan.totals.files_to_transfer);
//! # Ok(())
//! # }
//! ```

use crate::entry::Metadata;
use crate::error::{Result, XferError};
use crate::snapshot::Snapshot;
use crate::types::{MismatchPolicy, PlanItem, RequestKind, SessionTotals, SyncPlan};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Outcome of comparing two manifests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    /// Paths present only in the first (source) manifest
    pub only_in_source: BTreeSet<PathBuf>,
    /// Paths present only in the second (destination) manifest
    pub only_in_dest: BTreeSet<PathBuf>,
    /// Paths present in both with unequal metadata
    pub differing: BTreeSet<PathBuf>,
}

/// Compare two snapshots
///
/// # Errors
///
/// - [`XferError::IncompatibleDigest`] if the snapshots were built with
///   different digest algorithms, since their digests cannot be compared
pub fn diff(source: &Snapshot, dest: &Snapshot) -> Result<DiffResult> {
    if source.algorithm != dest.algorithm {
        return Err(XferError::IncompatibleDigest {
            left: source.algorithm.to_string(),
            right: dest.algorithm.to_string(),
        });
    }
    Ok(diff_manifests(&source.manifest, &dest.manifest))
}

/// Compare two manifests already known to use the same digest algorithm
pub fn diff_manifests(source: &[Metadata], dest: &[Metadata]) -> DiffResult {
    let source_map = metadata_map(source);
    let dest_map = metadata_map(dest);
    let mut result = DiffResult::default();

    for (path, source_entry) in &source_map {
        match dest_map.get(path) {
            Some(dest_entry) if dest_entry != source_entry => {
                result.differing.insert(path.to_path_buf());
            }
            Some(_) => {}
            None => {
                result.only_in_source.insert(path.to_path_buf());
            }
        }
    }

    for path in dest_map.keys() {
        if !source_map.contains_key(path) {
            result.only_in_dest.insert(path.to_path_buf());
        }
    }

    debug!(
        "Diff: {} only in source, {} only in dest, {} differing",
        result.only_in_source.len(),
        result.only_in_dest.len(),
        result.differing.len()
    );
    result
}

fn metadata_map(manifest: &[Metadata]) -> HashMap<&Path, &Metadata> {
    manifest.iter().map(|m| (m.name.as_path(), m)).collect()
}

impl DiffResult {
    /// Whether the two manifests describe the same content
    pub fn is_empty(&self) -> bool {
        self.only_in_source.is_empty() && self.only_in_dest.is_empty() && self.differing.is_empty()
    }

    /// Total number of paths in any of the three sets
    pub fn len(&self) -> usize {
        self.only_in_source.len() + self.only_in_dest.len() + self.differing.len()
    }

    /// Turn the comparison into ordered work for a sync session
    ///
    /// Source-only paths are transferred. Differing paths are verified first
    /// or transferred outright depending on `policy`. Destination-only paths
    /// are left alone. Items are in lexicographic path order.
    pub fn plan(&self, source: &Snapshot, policy: MismatchPolicy) -> SyncPlan {
        let source_map = metadata_map(&source.manifest);
        let differing_kind = match policy {
            MismatchPolicy::VerifyThenTransfer => RequestKind::Verify,
            MismatchPolicy::AlwaysTransfer => RequestKind::Transfer,
        };

        let mut wanted: Vec<(&PathBuf, RequestKind)> = self
            .only_in_source
            .iter()
            .map(|p| (p, RequestKind::Transfer))
            .chain(self.differing.iter().map(|p| (p, differing_kind)))
            .collect();
        wanted.sort_by(|a, b| a.0.cmp(b.0));

        let mut totals = SessionTotals {
            files_at_source: source.manifest.len() as u64,
            ..Default::default()
        };
        let mut items = Vec::with_capacity(wanted.len());

        for (path, kind) in wanted {
            let Some(metadata) = source_map.get(path.as_path()) else {
                continue;
            };
            match kind {
                RequestKind::Transfer => {
                    totals.files_to_transfer += 1;
                    totals.bytes_to_transfer += metadata.size;
                }
                RequestKind::Verify => {
                    totals.files_to_verify += 1;
                    totals.bytes_to_verify += metadata.size;
                }
            }
            items.push(PlanItem {
                kind,
                source: (*metadata).clone(),
            });
        }

        SyncPlan { items, totals }
    }

    /// Human-readable report, one line per path
    ///
    /// One-sided paths come first (left, then right), then differing paths.
    /// Equal roots are told apart with `@1` and `@2` suffixes.
    pub fn report_lines(&self, root_a: &Path, root_b: &Path) -> Vec<String> {
        let mut r1 = root_a.display().to_string();
        let mut r2 = root_b.display().to_string();
        if r1 == r2 {
            r1.push_str("@1");
            r2.push_str("@2");
        }

        let mut lines = Vec::with_capacity(self.len());
        for path in &self.only_in_source {
            lines.push(format!("Only in '{}': {}", r1, path.display()));
        }
        for path in &self.only_in_dest {
            lines.push(format!("Only in '{}': {}", r2, path.display()));
        }
        for path in &self.differing {
            lines.push(format!("Files differ: {}", path.display()));
        }
        lines
    }
}
