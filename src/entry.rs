//! Typed manifest entries and their line encoding
//!
//! Every entry serializes to exactly one line:
//!
//! ```text
//! TRANSFER_COMPLETE {"name":"foobar","size":123,"digest":"abcd","timestamp":1234.5678}
//! ```
//!
//! The tag is derived mechanically from the variant name with
//! [`camel_to_upper_snake`], and the payload is a compact JSON object, so
//! field order in the payload does not matter when decoding. Lines that
//! are blank or start with `#` (after optional whitespace) are comments.
//!
//! Decoding goes through a single registry keyed by tag; adding a variant
//! means adding one [`Record`] impl and one registry row.

use crate::error::{Result, XferError};
use crate::hasher::DigestAlgorithm;
use crate::utils::unix_timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Whether the local endpoint receives (pull) or sends (push) files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferDirection {
    /// Local endpoint is the destination
    #[default]
    Pull,
    /// Local endpoint is the source
    Push,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Pull => f.write_str("PULL"),
            TransferDirection::Push => f.write_str("PUSH"),
        }
    }
}

/// A file and its size, without a content digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the hierarchy root
    pub name: PathBuf,
    /// Size in bytes
    pub size: u64,
}

/// Content fingerprint of one file
///
/// For symlinks the digest covers the link target text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    /// Path relative to the hierarchy root
    pub name: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Hex-encoded digest
    pub digest: String,
}

/// A file must be copied from source to destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Path relative to the hierarchy root
    pub name: PathBuf,
    /// Expected size in bytes
    pub size: u64,
}

/// A file present at the destination must have its digest checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Path relative to the hierarchy root
    pub name: PathBuf,
    /// Expected size in bytes
    pub size: u64,
}

/// A transfer or verification finished successfully
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferComplete {
    /// Path relative to the hierarchy root
    pub name: PathBuf,
    /// Observed size in bytes
    pub size: u64,
    /// Observed digest
    pub digest: String,
    /// Completion time, seconds since the epoch
    pub timestamp: f64,
}

impl TransferComplete {
    /// Record a completion observed now
    pub fn now(name: impl Into<PathBuf>, size: u64, digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            digest: digest.into(),
            timestamp: unix_timestamp(),
        }
    }
}

/// Header of a sync session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Pull from or push to `remote_prefix`
    pub direction: TransferDirection,
    /// Session start time, seconds since the epoch
    pub timestamp: f64,
    /// Bytes planned for verification
    pub bytes_to_verify: u64,
    /// Files planned for verification
    pub files_to_verify: u64,
    /// Root of the remote hierarchy
    pub remote_prefix: PathBuf,
    /// Bytes planned for transfer
    pub bytes_to_transfer: u64,
    /// Files planned for transfer
    pub files_to_transfer: u64,
    /// Files in the source manifest
    pub files_at_source: u64,
    /// Algorithm every digest in this log was computed with
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,
}

/// Terminal marker of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDone {
    /// Completion time, seconds since the epoch
    pub timestamp: f64,
}

impl SyncDone {
    /// Terminal marker stamped with the current time
    pub fn now() -> Self {
        Self {
            timestamp: unix_timestamp(),
        }
    }
}

/// One typed record of a manifest or session log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entry {
    /// File name and size
    File(FileInfo),
    /// File fingerprint
    Metadata(Metadata),
    /// Copy instruction
    TransferRequest(TransferRequest),
    /// Verification instruction
    VerifyRequest(VerifyRequest),
    /// Completion record
    TransferComplete(TransferComplete),
    /// Session header
    SyncRequest(SyncRequest),
    /// Session terminator
    SyncDone(SyncDone),
}

/// A payload type that is one variant of [`Entry`]
pub trait Record: Serialize + DeserializeOwned + Into<Entry> {
    /// Variant name the tag is derived from
    const VARIANT: &'static str;
}

macro_rules! record {
    ($ty:ident, $variant:ident) => {
        impl Record for $ty {
            const VARIANT: &'static str = stringify!($variant);
        }

        impl From<$ty> for Entry {
            fn from(record: $ty) -> Self {
                Entry::$variant(record)
            }
        }
    };
}

record!(FileInfo, File);
record!(Metadata, Metadata);
record!(TransferRequest, TransferRequest);
record!(VerifyRequest, VerifyRequest);
record!(TransferComplete, TransferComplete);
record!(SyncRequest, SyncRequest);
record!(SyncDone, SyncDone);

type Decoder = fn(&str) -> serde_json::Result<Entry>;

fn decode_as<R: Record>(payload: &str) -> serde_json::Result<Entry> {
    serde_json::from_str::<R>(payload).map(Into::into)
}

const REGISTRY: [(&str, Decoder); 7] = [
    (FileInfo::VARIANT, decode_as::<FileInfo>),
    (Metadata::VARIANT, decode_as::<Metadata>),
    (TransferRequest::VARIANT, decode_as::<TransferRequest>),
    (VerifyRequest::VARIANT, decode_as::<VerifyRequest>),
    (TransferComplete::VARIANT, decode_as::<TransferComplete>),
    (SyncRequest::VARIANT, decode_as::<SyncRequest>),
    (SyncDone::VARIANT, decode_as::<SyncDone>),
];

struct TagEntry {
    variant: &'static str,
    tag: String,
    decode: Decoder,
}

fn tag_table() -> &'static [TagEntry] {
    static TABLE: OnceLock<Vec<TagEntry>> = OnceLock::new();
    TABLE.get_or_init(|| {
        REGISTRY
            .iter()
            .map(|&(variant, decode)| TagEntry {
                variant,
                tag: camel_to_upper_snake(variant),
                decode,
            })
            .collect()
    })
}

/// Convert a CamelCase name into an UPPER_SNAKE tag
///
/// A maximal run of uppercase letters stays together, except that its last
/// letter starts a new word when followed by a lowercase letter, so
/// `DAGMan` becomes `DAG_MAN`.
pub fn camel_to_upper_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_uppercase() {
            let prev_lower = chars[i - 1].is_lowercase();
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev_lower || next_lower {
                out.push('_');
            }
        }
        out.extend(c.to_uppercase());
    }

    out
}

/// Whether a raw line is a comment or blank and carries no entry
pub fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Decode one non-comment line, returning the failure reason on error
pub(crate) fn parse_line(line: &str) -> std::result::Result<Entry, String> {
    let trimmed = line.trim();
    let (tag, payload) = trimmed
        .split_once(' ')
        .ok_or_else(|| "expected '<TAG> <payload>'".to_string())?;

    let entry = tag_table()
        .iter()
        .find(|t| t.tag == tag)
        .ok_or_else(|| format!("unknown tag '{}'", tag))?;

    (entry.decode)(payload.trim()).map_err(|e| format!("invalid {} payload: {}", tag, e))
}

impl Entry {
    /// Name of the variant, e.g. `TransferRequest`
    pub fn variant_name(&self) -> &'static str {
        match self {
            Entry::File(_) => FileInfo::VARIANT,
            Entry::Metadata(_) => Metadata::VARIANT,
            Entry::TransferRequest(_) => TransferRequest::VARIANT,
            Entry::VerifyRequest(_) => VerifyRequest::VARIANT,
            Entry::TransferComplete(_) => TransferComplete::VARIANT,
            Entry::SyncRequest(_) => SyncRequest::VARIANT,
            Entry::SyncDone(_) => SyncDone::VARIANT,
        }
    }

    /// Line tag, e.g. `TRANSFER_REQUEST`
    pub fn tag(&self) -> &'static str {
        let variant = self.variant_name();
        tag_table()
            .iter()
            .find(|t| t.variant == variant)
            .map(|t| t.tag.as_str())
            .unwrap_or(variant)
    }

    /// Relative path the entry is about, if it names one
    pub fn name(&self) -> Option<&Path> {
        match self {
            Entry::File(r) => Some(&r.name),
            Entry::Metadata(r) => Some(&r.name),
            Entry::TransferRequest(r) => Some(&r.name),
            Entry::VerifyRequest(r) => Some(&r.name),
            Entry::TransferComplete(r) => Some(&r.name),
            Entry::SyncRequest(_) | Entry::SyncDone(_) => None,
        }
    }

    /// Encode as a single line, without the trailing newline
    pub fn encode(&self) -> Result<String> {
        let payload = serde_json::to_string(self)?;
        Ok(format!("{} {}", self.tag(), payload))
    }

    /// Decode a single entry line
    ///
    /// # Errors
    ///
    /// - [`XferError::MalformedEntry`] if the line is a comment, blank, has an
    ///   unknown tag, or carries an invalid payload
    pub fn decode(line: &str) -> Result<Self> {
        let malformed = |reason: String| XferError::MalformedEntry {
            line: 1,
            offset: 0,
            content: line.to_string(),
            reason,
        };
        if is_comment_or_blank(line) {
            return Err(malformed("no entry on comment or blank line".to_string()));
        }
        parse_line(line).map_err(malformed)
    }

    /// Write the encoded entry and a newline to `writer`
    pub fn write_entry_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut line = self.encode()?;
        line.push('\n');
        writer.write_all(line.as_bytes())?;
        Ok(())
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(line) => f.write_str(&line),
            Err(_) => write!(f, "{} <unencodable>", self.tag()),
        }
    }
}
