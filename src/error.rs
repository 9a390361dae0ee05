//! Error types for the xfer library
//!
//! Low-level I/O failures are wrapped into the kinds below at the component
//! boundary (hasher, copier, manifest reader) so that callers can tell a
//! missing source apart from a failed destination write or a corrupt log,
//! without inspecting raw OS error values.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the xfer library
pub type Result<T> = std::result::Result<T, XferError>;

/// Main error type for all xfer operations
#[derive(Debug, Error)]
pub enum XferError {
    /// I/O errors outside the component boundaries (snapshot files, CLI output)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Something other than a regular file or symlink was asked to be hashed
    #[error("Unsupported file type: {path:?}")]
    UnsupportedFileType {
        /// Path to the unsupported file
        path: PathBuf,
    },

    /// A manifest line matched neither a known tag nor the comment/blank pattern
    #[error("Malformed entry at line {line} (offset {offset}): {reason}: {content:?}")]
    MalformedEntry {
        /// 1-based line number
        line: usize,
        /// Byte offset of the start of the line
        offset: u64,
        /// The offending line, as read
        content: String,
        /// Why decoding failed
        reason: String,
    },

    /// The copy source could not be opened or read
    #[error("Source unavailable: {path:?}: {source}")]
    SourceUnavailable {
        /// Source path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Writing the temporary file or renaming it into place failed
    #[error("Write failed: {path:?}: {source}")]
    WriteFailed {
        /// Destination path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Digest mismatch discovered during verification or replay
    #[error("Integrity violation for {path:?} - expected: {expected}, actual: {actual}")]
    IntegrityViolation {
        /// Relative path of the offending file
        path: PathBuf,
        /// Digest recorded for the source
        expected: String,
        /// Digest actually observed
        actual: String,
    },

    /// Two manifests were produced with different digest algorithms
    #[error("Incompatible digest algorithms: {left} vs {right}")]
    IncompatibleDigest {
        /// Algorithm of the first manifest
        left: String,
        /// Algorithm of the second manifest
        right: String,
    },

    /// The log is well-formed line by line but violates session structure
    #[error("Invalid log: {0}")]
    InvalidLog(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The session was cancelled before every planned item completed
    #[error("Session cancelled")]
    Cancelled,

    /// Path conversion error
    #[error("Path conversion error: {0:?}")]
    PathConversion(std::ffi::OsString),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XferError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        XferError::Internal(msg.into())
    }

    /// Create an invalid-log error with a custom message
    pub fn invalid_log(msg: impl Into<String>) -> Self {
        XferError::InvalidLog(msg.into())
    }

    /// Check if this error indicates corrupted or tampered data
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, XferError::IntegrityViolation { .. })
    }

    /// Check if retrying the same operation could plausibly succeed
    ///
    /// No retry policy is applied by the library itself; this only helps
    /// callers that choose to implement one.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            XferError::SourceUnavailable { .. } | XferError::WriteFailed { .. } | XferError::Cancelled
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            XferError::IntegrityViolation { path, expected, actual } => {
                format!(
                    "File {:?} does not match its recorded digest (expected {}, got {}). \
                     The data may be corrupted or the source changed during the sync.",
                    path, expected, actual
                )
            }
            XferError::IncompatibleDigest { left, right } => {
                format!(
                    "Manifests were built with different digest algorithms ({} and {}). \
                     Rebuild both with the same algorithm before comparing.",
                    left, right
                )
            }
            XferError::Cancelled => {
                "Sync was cancelled. Run the same command again to resume from the log.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
