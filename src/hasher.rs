//! Streaming content digests for files and symlinks
//!
//! Regular files are read in fixed-size chunks (1 MiB) and folded into a
//! running digest, so memory use is bounded regardless of file size.
//! Symlinks are never followed: their digest is computed over the UTF-8
//! bytes of the link target text, which lets a directory walk include
//! them without risking cycles.
//!
//! Digests are a function of content only. Two manifests are only
//! comparable when they were produced with the same [`DigestAlgorithm`],
//! which is why the algorithm is recorded alongside every manifest.
//!
//! ## Example
//!
//! ```rust,no_run
//! use xfer::hasher::{hash_file, DigestAlgorithm};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (digest, size) = hash_file(Path::new("data.bin"), DigestAlgorithm::Sha512)?;
//! println!("{} ({} bytes)", digest, size);
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, XferError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::{self, File, FileType};
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::str::FromStr;
use tracing::trace;

/// Chunk size used for every streaming read
pub const BUFFER_SIZE: usize = 1 << 20;

/// Cryptographic hash used to fingerprint file content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256, 64 hex characters
    Sha256,
    /// SHA-512, 128 hex characters
    #[default]
    Sha512,
}

impl DigestAlgorithm {
    /// Stable identifier recorded in manifests and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Length of a hex-encoded digest produced by this algorithm
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    /// Start a new running digest
    pub fn hasher(&self) -> StreamingHasher {
        match self {
            DigestAlgorithm::Sha256 => StreamingHasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => StreamingHasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = XferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(XferError::InvalidConfiguration(format!(
                "unknown digest algorithm '{}'",
                other
            ))),
        }
    }
}

/// A running digest that chunks can be folded into
///
/// Used by the hasher and by the atomic copier, which folds each chunk in
/// the same pass that writes it to the destination.
#[derive(Debug, Clone)]
pub enum StreamingHasher {
    /// Running SHA-256 state
    Sha256(Sha256),
    /// Running SHA-512 state
    Sha512(Sha512),
}

impl StreamingHasher {
    /// Fold a chunk into the digest
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamingHasher::Sha256(h) => h.update(data),
            StreamingHasher::Sha512(h) => h.update(data),
        }
    }

    /// Finish and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Sha256(h) => hex::encode(h.finalize()),
            StreamingHasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash arbitrary in-memory data
pub fn hash_bytes(data: &[u8], algorithm: DigestAlgorithm) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Hash a regular file's content, returning the digest and the byte count
///
/// # Errors
///
/// - [`XferError::SourceUnavailable`] if the file cannot be opened or read
pub fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> Result<(String, u64)> {
    let unavailable = |source| XferError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(unavailable)?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(unavailable(e)),
        };
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    trace!("Hashed {:?} ({} bytes)", path, total);
    Ok((hasher.finalize_hex(), total))
}

/// Hash the target text of a symlink without following it
pub fn hash_symlink(path: &Path, algorithm: DigestAlgorithm) -> Result<String> {
    let target = fs::read_link(path).map_err(|source| XferError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    let text = target
        .to_str()
        .ok_or_else(|| XferError::PathConversion(target.clone().into_os_string()))?;
    Ok(hash_bytes(text.as_bytes(), algorithm))
}

/// Compute the digest of a file or symlink
///
/// `file_type` should come from `symlink_metadata` so that symlinks are
/// seen as symlinks rather than as their targets.
///
/// # Errors
///
/// - [`XferError::UnsupportedFileType`] for directories, sockets, FIFOs and devices
/// - [`XferError::SourceUnavailable`] if the path cannot be read
pub fn digest(path: &Path, file_type: FileType, algorithm: DigestAlgorithm) -> Result<String> {
    if file_type.is_file() {
        hash_file(path, algorithm).map(|(digest, _)| digest)
    } else if file_type.is_symlink() {
        hash_symlink(path, algorithm)
    } else {
        Err(XferError::UnsupportedFileType {
            path: path.to_path_buf(),
        })
    }
}
