//! Tar container for backups
//!
//! Every backup produces one tar stream with a fixed layout:
//!
//! ```text
//! snapshot.chain          encoded SnapshotChain (see compression.rs)
//! snapshot/<entry path>   content of every Add entry of the latest diff
//! ```
//!
//! The chain always comes first so a reader can decide what to do with the
//! payloads before unpacking them. Headers are written in deterministic mode
//! except for the mtime, which carries the file's own timestamp so restored
//! files keep it.

use crate::error::{Result, SyncError};
use crate::utils;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header, HeaderMode};
use tracing::{debug, trace, warn};

/// Archive member holding the encoded chain
pub const CHAIN_ENTRY: &str = "snapshot.chain";

/// Directory prefix of payload members
pub const PAYLOAD_PREFIX: &str = "snapshot";

/// Upper bound on the up-front buffer for the chain member
const CHAIN_PREALLOC_LIMIT: u64 = 1 << 20;

/// Streams a backup archive into any writer
pub struct ArchiveWriter<W: Write> {
    builder: Builder<W>,
    has_chain: bool,
    broken: bool,
    files: usize,
    bytes: u64,
}

impl<W: Write> ArchiveWriter<W> {
    /// Start a new archive
    pub fn new(writer: W) -> Self {
        let mut builder = Builder::new(writer);
        builder.mode(HeaderMode::Deterministic);
        Self {
            builder,
            has_chain: false,
            broken: false,
            files: 0,
            bytes: 0,
        }
    }

    /// Write the chain blob; must be the first member
    pub fn append_chain(&mut self, blob: &[u8]) -> Result<()> {
        if self.has_chain || self.files > 0 {
            return Err(SyncError::archive("chain must be written exactly once, first"));
        }

        let mut header = regular_header(blob.len() as u64, 0);
        self.builder.append_data(&mut header, CHAIN_ENTRY, blob)?;
        self.has_chain = true;
        trace!("Archived chain blob ({} bytes)", blob.len());
        Ok(())
    }

    /// Copy `source` into the archive as the payload for `relative`
    ///
    /// Returns the number of bytes written. Failures while opening the
    /// source leave the archive intact. A failure once the header is out
    /// marks the writer broken, see [`ArchiveWriter::is_broken`].
    pub fn append_payload(&mut self, relative: &str, source: &Path) -> Result<u64> {
        if !self.has_chain {
            return Err(SyncError::archive("payload written before the chain"));
        }

        let file = File::open(source)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(SyncError::archive(format!(
                "expected regular file for payload: {}",
                source.display()
            )));
        }

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let length = self.append_reader(relative, file, metadata.len(), mtime)?;

        if fs::metadata(source).map(|m| m.len()).unwrap_or(length) != length {
            warn!("{} changed size while archiving; stored its first {} bytes", relative, length);
        }
        Ok(length)
    }

    /// Write exactly `length` bytes from `reader` as the payload member
    fn append_reader<R: Read>(&mut self, relative: &str, reader: R, length: u64, mtime: u64) -> Result<u64> {
        if self.broken {
            return Err(SyncError::archive("archive is incomplete after an earlier failure"));
        }

        let mut header = regular_header(length, mtime);
        let member = format!("{}/{}", PAYLOAD_PREFIX, relative);
        let mut exact = ExactReader {
            inner: reader.take(length),
            remaining: length,
        };

        if let Err(e) = self.builder.append_data(&mut header, &member, &mut exact) {
            self.broken = true;
            return Err(SyncError::archive(format!(
                "payload {} could not be written in full, archive is incomplete: {}",
                relative, e
            )));
        }

        self.files += 1;
        self.bytes += length;
        trace!("Archived payload {} ({} bytes)", relative, length);
        Ok(length)
    }

    /// Whether a member was cut short, leaving the stream misframed
    ///
    /// A broken writer refuses further members and [`ArchiveWriter::finish`].
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Payload files written so far
    pub fn files(&self) -> usize {
        self.files
    }

    /// Payload bytes written so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Write the trailer and hand back the underlying writer
    pub fn finish(self) -> Result<W> {
        if self.broken {
            return Err(SyncError::archive("archive is incomplete after an earlier failure"));
        }
        if !self.has_chain {
            return Err(SyncError::archive("archive has no chain"));
        }
        debug!(
            "Finished archive: {} payload file(s), {}",
            self.files,
            utils::format_bytes(self.bytes)
        );
        Ok(self.builder.into_inner()?)
    }
}

/// Yields exactly `remaining` bytes, failing if the source ends early
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let read = self.inner.read(buf)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended {} bytes short", self.remaining),
            ));
        }
        self.remaining -= read as u64;
        Ok(read)
    }
}

fn regular_header(size: u64, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(mtime);
    header.set_size(size);
    header
}

/// What [`extract_to`] found in an archive
#[derive(Debug)]
pub struct ExtractedArchive {
    /// Raw chain blob
    pub chain_blob: Vec<u8>,
    /// Directory under the staging root holding the payload tree
    pub payload_root: PathBuf,
    /// Number of payload files unpacked
    pub payload_count: usize,
}

/// Unpack an archive into `staging`
///
/// The chain is kept in memory, payloads land under
/// `staging/snapshot/<entry path>`. Members outside the known layout are
/// skipped with a warning.
///
/// # Errors
///
/// - [`SyncError::UnsafePath`] if a member path is absolute or contains `..`
/// - [`SyncError::Archive`] if there is no chain member
/// - [`SyncError::Io`] on read or unpack failures
pub fn extract_to<R: Read>(reader: R, staging: &Path) -> Result<ExtractedArchive> {
    let payload_root = staging.join(PAYLOAD_PREFIX);
    let mut archive = Archive::new(reader);
    let mut chain_blob = None;
    let mut payload_count = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let member = utils::normalize_relative(&entry.path()?)?;

        if member == CHAIN_ENTRY {
            let declared = entry.size();
            let mut blob = Vec::with_capacity(declared.min(CHAIN_PREALLOC_LIMIT) as usize);
            entry.read_to_end(&mut blob)?;
            if blob.len() as u64 != declared {
                return Err(SyncError::archive(format!(
                    "{} member is truncated: {} of {} bytes",
                    CHAIN_ENTRY,
                    blob.len(),
                    declared
                )));
            }
            chain_blob = Some(blob);
            continue;
        }

        let relative = match member.strip_prefix(PAYLOAD_PREFIX).and_then(|r| r.strip_prefix('/')) {
            Some(relative) if !relative.is_empty() => relative.to_string(),
            _ => {
                if entry.header().entry_type() != EntryType::Directory {
                    warn!("Skipping unexpected archive member {:?}", member);
                }
                continue;
            }
        };

        if entry.header().entry_type() != EntryType::Regular {
            trace!("Skipping non-file member {:?}", member);
            continue;
        }

        let destination = utils::safe_join(&payload_root, &relative)?;
        utils::ensure_parent(&destination)?;
        entry.unpack(&destination)?;
        payload_count += 1;
    }

    let chain_blob =
        chain_blob.ok_or_else(|| SyncError::archive(format!("missing {} member", CHAIN_ENTRY)))?;

    debug!("Extracted {} payload file(s) to {:?}", payload_count, payload_root);
    Ok(ExtractedArchive {
        chain_blob,
        payload_root,
        payload_count,
    })
}
