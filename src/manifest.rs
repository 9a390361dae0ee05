//! Streaming manifest logs
//!
//! A log is an append-only sequence of entry lines. [`read_manifest`] opens
//! the file fresh on every call and yields `(entry, offset)` pairs lazily,
//! so arbitrarily large logs can be replayed without loading them into
//! memory. The offset is the byte position just past the entry's line,
//! which is where a resumed writer may continue.
//!
//! [`ManifestWriter`] serializes appends behind a mutex and flushes every
//! line to disk before returning, so a reader racing the writer never sees
//! two lines interleaved. A crash can still leave a torn final line; the
//! reader treats an unterminated, undecodable last line as such and stops
//! cleanly at the last complete entry.
//!
//! ## Example
//!
//! ```rust,no_run
//! use xfer::entry::{Entry, FileInfo};
//! use xfer::manifest::{read_manifest, ManifestWriter};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let writer = ManifestWriter::create(Path::new("files.log"))?;
//! writer.write_entry(&FileInfo { name: "a.txt".into(), size: 3 }.into())?;
//!
//! for item in read_manifest(Path::new("files.log"))? {
//!     let (entry, offset) = item?;
//!     println!("{} (ends at {})", entry, offset);
//! }
//! # Ok(())
//! # }
//! ```

use crate::entry::{is_comment_or_blank, parse_line, Entry, Metadata, SyncDone, SyncRequest, TransferComplete};
use crate::error::{Result, XferError};
use crate::types::{PlanItem, RequestKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Open a log for lazy, in-order decoding
///
/// Each call opens the file anew, so the sequence can be restarted by
/// calling again.
///
/// # Errors
///
/// - [`XferError::SourceUnavailable`] if the log cannot be opened
pub fn read_manifest(path: &Path) -> Result<ManifestReader<BufReader<File>>> {
    let file = File::open(path).map_err(|source| XferError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ManifestReader::new(BufReader::new(file)).with_path(path))
}

/// Iterator over the entries of a log
///
/// After the first error the iterator is exhausted: a log with one bad line
/// cannot be trusted past that point.
#[derive(Debug)]
pub struct ManifestReader<R> {
    reader: R,
    path: PathBuf,
    buf: Vec<u8>,
    offset: u64,
    line_no: usize,
    finished: bool,
}

impl<R: BufRead> ManifestReader<R> {
    /// Decode entries from any buffered reader
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            path: PathBuf::new(),
            buf: Vec::new(),
            offset: 0,
            line_no: 0,
            finished: false,
        }
    }

    /// Name the log in read errors
    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = path.to_path_buf();
        self
    }

    fn next_entry(&mut self) -> Result<Option<(Entry, u64)>> {
        loop {
            self.buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .map_err(|source| XferError::SourceUnavailable {
                    path: self.path.clone(),
                    source,
                })?;
            if read == 0 {
                return Ok(None);
            }

            let line_start = self.offset;
            self.offset += read as u64;
            self.line_no += 1;
            let terminated = self.buf.last() == Some(&b'\n');

            let decoded = match std::str::from_utf8(&self.buf) {
                Ok(line) if is_comment_or_blank(line) => continue,
                Ok(line) => parse_line(line),
                Err(e) => Err(format!("invalid UTF-8: {}", e)),
            };

            match decoded {
                Ok(entry) => return Ok(Some((entry, self.offset))),
                Err(reason) if !terminated => {
                    warn!(
                        "Ignoring torn final line {} at offset {}: {}",
                        self.line_no, line_start, reason
                    );
                    return Ok(None);
                }
                Err(reason) => {
                    return Err(XferError::MalformedEntry {
                        line: self.line_no,
                        offset: line_start,
                        content: String::from_utf8_lossy(&self.buf).trim_end().to_string(),
                        reason,
                    });
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for ManifestReader<R> {
    type Item = Result<(Entry, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Append-only writer for a log file
///
/// Safe to share between threads; each append holds the lock for the
/// whole write-and-flush.
#[derive(Debug)]
pub struct ManifestWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl ManifestWriter {
    /// Create (or truncate) a log
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| Self::write_failed(path, source))?;
        Ok(Self::from_file(path, file))
    }

    /// Open a log for appending, creating it if missing
    pub fn append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Self::write_failed(path, source))?;
        Ok(Self::from_file(path, file))
    }

    /// Reopen an interrupted log for appending after its last complete entry
    ///
    /// Truncates anything past `valid_len` (a torn line, trailing comments)
    /// and makes sure the file ends with a newline.
    pub fn resume(path: &Path, valid_len: u64) -> Result<Self> {
        {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|source| Self::write_failed(path, source))?;
            let fix = |e| Self::write_failed(path, e);

            let current = file.metadata().map_err(fix)?.len();
            if current > valid_len {
                debug!("Truncating {:?} from {} to {} bytes", path, current, valid_len);
                file.set_len(valid_len).map_err(fix)?;
            }

            if valid_len > 0 {
                let mut last = [0u8; 1];
                file.seek(SeekFrom::Start(valid_len - 1)).map_err(fix)?;
                file.read_exact(&mut last).map_err(fix)?;
                if last[0] != b'\n' {
                    file.seek(SeekFrom::End(0)).map_err(fix)?;
                    file.write_all(b"\n").map_err(fix)?;
                }
            }
            file.sync_data().map_err(fix)?;
        }
        Self::append(path)
    }

    fn from_file(path: &Path, file: File) -> Self {
        Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        }
    }

    fn write_failed(path: &Path, source: std::io::Error) -> XferError {
        XferError::WriteFailed {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Path of the underlying log
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk
    pub fn write_entry(&self, entry: &Entry) -> Result<()> {
        let mut line = entry.encode()?;
        line.push('\n');
        self.write_line(&line)
    }

    /// Append a `# comment` line
    pub fn write_comment(&self, text: &str) -> Result<()> {
        let mut line = String::with_capacity(text.len() + 3);
        for part in text.lines() {
            line.push_str("# ");
            line.push_str(part);
            line.push('\n');
        }
        self.write_line(&line)
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data())
            .map_err(|source| Self::write_failed(&self.path, source))
    }
}

/// Everything a session needs from an existing log
#[derive(Debug, Clone, Default)]
pub struct LogReplay {
    /// The session header, if one was written
    pub request: Option<SyncRequest>,
    /// Planned items in the order they were announced
    pub planned: Vec<PlanItem>,
    /// Completion records in the order they were appended
    pub completed: Vec<TransferComplete>,
    /// The terminal marker, if the session finished
    pub done: Option<SyncDone>,
    /// Number of decoded entries
    pub entries: usize,
    /// Byte offset just past the last complete entry
    pub valid_len: u64,
}

impl LogReplay {
    /// Whether the log is sealed by `SyncDone`
    pub fn is_sealed(&self) -> bool {
        self.done.is_some()
    }
}

/// Replay a session log from the start and check its structure
///
/// # Errors
///
/// - [`XferError::MalformedEntry`] for an undecodable line
/// - [`XferError::InvalidLog`] when the header is missing or repeated, when
///   entries follow `SyncDone`, or when a request has no recorded source
///   metadata
pub fn replay(path: &Path) -> Result<LogReplay> {
    let mut replay = LogReplay::default();
    let mut sources: HashMap<PathBuf, Metadata> = HashMap::new();

    for item in read_manifest(path)? {
        let (entry, offset) = item?;
        replay.entries += 1;
        replay.valid_len = offset;

        if replay.done.is_some() {
            return Err(XferError::invalid_log(format!(
                "{} entry after SYNC_DONE",
                entry.tag()
            )));
        }

        match entry {
            Entry::SyncRequest(request) => {
                if replay.entries != 1 {
                    return Err(XferError::invalid_log(
                        "SYNC_REQUEST must be the first entry of a log",
                    ));
                }
                replay.request = Some(request);
            }
            _ if replay.request.is_none() => {
                return Err(XferError::invalid_log(format!(
                    "{} entry before SYNC_REQUEST",
                    entry.tag()
                )));
            }
            Entry::Metadata(metadata) => {
                sources.insert(metadata.name.clone(), metadata);
            }
            Entry::TransferRequest(req) => {
                replay.planned.push(planned_item(&sources, RequestKind::Transfer, &req.name, req.size)?);
            }
            Entry::VerifyRequest(req) => {
                replay.planned.push(planned_item(&sources, RequestKind::Verify, &req.name, req.size)?);
            }
            Entry::TransferComplete(complete) => replay.completed.push(complete),
            Entry::SyncDone(done) => replay.done = Some(done),
            Entry::File(_) => {}
        }
    }

    Ok(replay)
}

fn planned_item(
    sources: &HashMap<PathBuf, Metadata>,
    kind: RequestKind,
    name: &Path,
    size: u64,
) -> Result<PlanItem> {
    let source = sources
        .get(name)
        .ok_or_else(|| XferError::invalid_log(format!("no source METADATA recorded for {:?}", name)))?;
    if source.size != size {
        return Err(XferError::invalid_log(format!(
            "request size {} for {:?} disagrees with recorded size {}",
            size, name, source.size
        )));
    }
    Ok(PlanItem {
        kind,
        source: source.clone(),
    })
}
