//! Atomic, hash-verified file copy
//!
//! [`copy_with_hash`] streams the source into a temporary file created next
//! to the destination, folding every chunk into a digest in the same pass.
//! Only after the data is synced to disk is the temporary file renamed over
//! the destination path. Any failure drops the temporary file, which
//! removes it, so the destination is never observed half-written and never
//! comes into existence on failure.
//!
//! [`copy_entry`] can also be given the source fingerprint the copy must
//! match. The digest is then checked before the rename, so data that no
//! longer matches its recorded fingerprint never reaches the destination.

use crate::entry::Metadata;
use crate::error::{Result, XferError};
use crate::hasher::{hash_bytes, DigestAlgorithm, BUFFER_SIZE};
use crate::utils::format_bytes;
use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Suffix of the staging files created next to each destination
pub const TEMP_SUFFIX: &str = ".xfer-tmp";

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Copy `source` to `dest`, returning the digest and byte count of the copied data
///
/// The destination's parent directory must already exist.
///
/// # Errors
///
/// - [`XferError::SourceUnavailable`] if the source cannot be opened or read
/// - [`XferError::WriteFailed`] if staging, syncing or renaming fails
///
/// In both cases `dest` is left exactly as it was before the call.
pub fn copy_with_hash(source: &Path, dest: &Path, algorithm: DigestAlgorithm) -> Result<(String, u64)> {
    copy_file(source, dest, algorithm, None)
}

fn check_expected(expected: Option<&Metadata>, digest: &str) -> Result<()> {
    match expected {
        Some(meta) if meta.digest != digest => Err(XferError::IntegrityViolation {
            path: meta.name.clone(),
            expected: meta.digest.clone(),
            actual: digest.to_string(),
        }),
        _ => Ok(()),
    }
}

fn copy_file(
    source: &Path,
    dest: &Path,
    algorithm: DigestAlgorithm,
    expected: Option<&Metadata>,
) -> Result<(String, u64)> {
    let unavailable = |e| XferError::SourceUnavailable {
        path: source.to_path_buf(),
        source: e,
    };
    let write_failed = |e| XferError::WriteFailed {
        path: dest.to_path_buf(),
        source: e,
    };

    let mut src = File::open(source).map_err(unavailable)?;
    let total = src.metadata().map_err(unavailable)?.len();

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut prefix = OsString::from(".");
    if let Some(name) = dest.file_name() {
        prefix.push(name);
    }
    prefix.push(".");

    let mut staged = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
        .map_err(write_failed)?;
    trace!("Staging {:?} at {:?}", dest, staged.path());

    debug!("Copying {:?} to {:?} ({})", source, dest, format_bytes(total));
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;
    let mut last_log = Instant::now();

    loop {
        let n = match src.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(unavailable(e)),
        };
        hasher.update(&buffer[..n]);
        staged.write_all(&buffer[..n]).map_err(write_failed)?;
        copied += n as u64;

        if last_log.elapsed() >= PROGRESS_INTERVAL {
            let percent = if total > 0 {
                copied as f64 / total as f64 * 100.0
            } else {
                100.0
            };
            debug!(
                "Copied {} of {} of {:?}; {:.1}% done",
                format_bytes(copied),
                format_bytes(total),
                source,
                percent
            );
            last_log = Instant::now();
        }
    }

    let digest = hasher.finalize_hex();
    check_expected(expected, &digest)?;

    staged.flush().map_err(write_failed)?;
    staged.as_file().sync_all().map_err(write_failed)?;
    staged.persist(dest).map_err(|e| write_failed(e.error))?;

    debug!("Copied {:?} ({} bytes, {} {})", dest, copied, algorithm, digest);
    Ok((digest, copied))
}

/// Recreate the symlink `source` at `dest` without following it
///
/// The digest and size describe the link target text, matching how the
/// snapshot walker fingerprints symlinks. The link is created under a
/// temporary name and renamed into place.
#[cfg(unix)]
pub fn copy_symlink_with_hash(source: &Path, dest: &Path, algorithm: DigestAlgorithm) -> Result<(String, u64)> {
    copy_symlink(source, dest, algorithm, None)
}

#[cfg(unix)]
fn copy_symlink(
    source: &Path,
    dest: &Path,
    algorithm: DigestAlgorithm,
    expected: Option<&Metadata>,
) -> Result<(String, u64)> {
    let target = std::fs::read_link(source).map_err(|e| XferError::SourceUnavailable {
        path: source.to_path_buf(),
        source: e,
    })?;
    let text = target
        .to_str()
        .ok_or_else(|| XferError::PathConversion(target.clone().into_os_string()))?;
    let digest = hash_bytes(text.as_bytes(), algorithm);
    check_expected(expected, &digest)?;

    let write_failed = |e| XferError::WriteFailed {
        path: dest.to_path_buf(),
        source: e,
    };

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let staged = tempfile::Builder::new()
        .prefix(".")
        .suffix(TEMP_SUFFIX)
        .make_in(parent, |path| std::os::unix::fs::symlink(&target, path))
        .map_err(write_failed)?;
    staged.persist(dest).map_err(|e| write_failed(e.error))?;

    debug!("Linked {:?} -> {:?}", dest, target);
    Ok((digest, text.len() as u64))
}

/// Symlinks cannot be recreated portably outside unix
#[cfg(not(unix))]
pub fn copy_symlink_with_hash(source: &Path, dest: &Path, algorithm: DigestAlgorithm) -> Result<(String, u64)> {
    copy_symlink(source, dest, algorithm, None)
}

#[cfg(not(unix))]
fn copy_symlink(
    source: &Path,
    _dest: &Path,
    _algorithm: DigestAlgorithm,
    _expected: Option<&Metadata>,
) -> Result<(String, u64)> {
    Err(XferError::UnsupportedFileType {
        path: source.to_path_buf(),
    })
}

/// Copy a regular file or symlink, choosing the strategy from the source's own type
///
/// When `expected` is given, the copied digest must equal its digest or the
/// copy is discarded before it reaches `dest`.
///
/// # Errors
///
/// - [`XferError::UnsupportedFileType`] if the source is neither a file nor a symlink
/// - [`XferError::IntegrityViolation`] if the content does not match `expected`
/// - anything [`copy_with_hash`] or [`copy_symlink_with_hash`] returns
pub fn copy_entry(
    source: &Path,
    dest: &Path,
    algorithm: DigestAlgorithm,
    expected: Option<&Metadata>,
) -> Result<(String, u64)> {
    let file_type = std::fs::symlink_metadata(source)
        .map_err(|e| XferError::SourceUnavailable {
            path: source.to_path_buf(),
            source: e,
        })?
        .file_type();

    if file_type.is_symlink() {
        copy_symlink(source, dest, algorithm, expected)
    } else if file_type.is_file() {
        copy_file(source, dest, algorithm, expected)
    } else {
        Err(XferError::UnsupportedFileType {
            path: source.to_path_buf(),
        })
    }
}
