//! Utility functions for xfer
//!
//! Path manipulation, timestamps and byte formatting shared by the
//! snapshot walker, the sync session and the CLI.

use crate::error::{Result, XferError};
use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Current time as fractional seconds since the Unix epoch
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Render a fractional Unix timestamp as RFC 3339, if it is in range
pub fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    match Utc.timestamp_opt(secs as i64, nanos).single() {
        Some(dt) => {
            let dt: DateTime<Utc> = dt;
            dt.to_rfc3339()
        }
        None => format!("{}", timestamp),
    }
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symlinks below `base` keep their own
/// path instead of resolving to their target.
///
/// # Errors
///
/// - [`XferError::Internal`] if the path is not under the base path
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            XferError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Check that a path taken from a manifest stays inside its root
///
/// Rejects absolute paths and any `..` component, so joining the name onto
/// a root can never escape it.
pub fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Create the parent directory of `path` if it is missing
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|source| XferError::WriteFailed {
                path: path.to_path_buf(),
                source,
            })?;
            trace!("Created directory {:?}", parent);
        }
    }
    Ok(())
}

/// Create the directories leading to `relative` under `root` and return the
/// joined path
///
/// Every existing ancestor below `root` must be a real directory. A symlink
/// there could redirect the write outside the hierarchy, so it is refused.
///
/// # Errors
///
/// - [`XferError::WriteFailed`] naming the first ancestor that is a symlink
///   or not a directory, or that could not be created
pub fn ensure_dir_under(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut current = root.to_path_buf();
    let parents = relative.parent().map(Path::components).into_iter().flatten();

    for component in parents {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_dir() => {}
            Ok(meta) => {
                let kind = if meta.file_type().is_symlink() {
                    "symlink"
                } else {
                    "non-directory"
                };
                return Err(XferError::WriteFailed {
                    path: current,
                    source: io::Error::other(format!("refusing to write through {}", kind)),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&current).map_err(|source| XferError::WriteFailed {
                    path: current.clone(),
                    source,
                })?;
                trace!("Created directory {:?}", current);
            }
            Err(source) => return Err(XferError::WriteFailed { path: current, source }),
        }
    }

    Ok(root.join(relative))
}

/// Format bytes in human-readable form (1024-based units)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
