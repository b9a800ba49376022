//! Incremental mbox reader.
//!
//! Messages in an mbox file are delimited by lines beginning with
//! `From ` at column 0. A [`MboxReader`] keeps a table of contents of
//! `(start, end)` byte spans, one per message, and only ever scans the
//! bytes appended since it last looked, so a large archive that gains a
//! handful of new messages is cheap to catch up.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MailsieveError, Result};
use crate::hashing::base36;

/// One message's byte span within its mbox file, end-exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    toc: Vec<Span>,
    file_length: u64,
    last_parsed: i64,
}

/// A single mbox file with a persisted, incrementally-updated TOC.
pub struct MboxReader {
    mailbox_id: String,
    path: PathBuf,
    snapshot_path: PathBuf,
    toc: Vec<Span>,
    file_length: u64,
    /// Key of the last message the scanner has already turned into an
    /// MR, or `-1` if none. Distinct from `toc.len()`, which only
    /// tracks how much of the file has been scanned for boundaries.
    last_parsed: i64,
}

impl MboxReader {
    /// Open `path`, loading a persisted TOC snapshot from `snapshot_path`
    /// if one exists, or building one from scratch by scanning the
    /// entire file.
    pub fn open(mailbox_id: &str, path: &Path, snapshot_path: PathBuf) -> Result<Self> {
        if let Some(snapshot) = read_snapshot(&snapshot_path)? {
            return Ok(Self {
                mailbox_id: mailbox_id.to_string(),
                path: path.to_path_buf(),
                snapshot_path,
                toc: snapshot.toc,
                file_length: snapshot.file_length,
                last_parsed: snapshot.last_parsed,
            });
        }

        let mut reader = Self {
            mailbox_id: mailbox_id.to_string(),
            path: path.to_path_buf(),
            snapshot_path,
            toc: Vec::new(),
            file_length: 0,
            last_parsed: -1,
        };
        reader.scan_from(0)?;
        Ok(reader)
    }

    pub fn mailbox_id(&self) -> &str {
        &self.mailbox_id
    }

    /// Number of messages currently known.
    pub fn len(&self) -> usize {
        self.toc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toc.is_empty()
    }

    pub fn span(&self, key: usize) -> Option<Span> {
        self.toc.get(key).copied()
    }

    /// Key of the last message already turned into an MR, or `-1`.
    pub fn last_parsed(&self) -> i64 {
        self.last_parsed
    }

    /// Record that message `key` has been turned into an MR.
    pub fn set_last_parsed(&mut self, key: usize) {
        self.last_parsed = key as i64;
    }

    /// Persist the TOC, file length, and last-parsed marker.
    pub fn save(&self) -> Result<()> {
        self.persist()
    }

    /// `<mailbox_id><base36(start_byte)>`: a stable locator for message
    /// `key`, independent of in-memory layout.
    pub fn pointer(&self, key: usize) -> Option<String> {
        self.span(key)
            .map(|span| format!("{}{}", self.mailbox_id, base36(span.start)))
    }

    /// Read message `key`'s raw bytes (including its `From ` separator line).
    pub fn read_message(&self, key: usize) -> Result<Vec<u8>> {
        let span = self
            .span(key)
            .ok_or_else(|| MailsieveError::InvalidData(format!("no such message key {key}")))?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(span.start))?;
        let mut buf = vec![0u8; (span.end - span.start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Scan any bytes appended since the TOC was last built, validating
    /// that the mailbox hasn't been truncated or rewritten underneath
    /// us, then persist the updated TOC.
    pub fn update(&mut self) -> Result<usize> {
        let on_disk_len = self.path.metadata()?.len();
        if on_disk_len < self.file_length {
            return Err(MailsieveError::MailboxMutated(format!(
                "{} shrank from {} to {on_disk_len} bytes",
                self.path.display(),
                self.file_length
            )));
        }

        if let Some(last) = self.toc.last() {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(last.start))?;
            let mut marker = [0u8; 5];
            if file.read_exact(&mut marker).is_err() || &marker != b"From " {
                return Err(MailsieveError::MailboxMutated(format!(
                    "{} no longer begins message at offset {} with 'From '",
                    self.path.display(),
                    last.start
                )));
            }
        }

        if on_disk_len == self.file_length {
            return Ok(0);
        }

        let added = self.scan_from(self.file_length)?;
        self.persist()?;
        Ok(added)
    }

    /// Scan `From ` boundaries starting at byte offset `from`, appending
    /// discovered spans to the TOC and updating `file_length`.
    fn scan_from(&mut self, from: u64) -> Result<usize> {
        let file = File::open(&self.path)?;
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(from))?;

        let mut pos = from;
        let mut starts = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = read_line_bytes(&mut reader, &mut line)?;
            if n == 0 {
                break;
            }
            if line.starts_with(b"From ") {
                starts.push(pos);
            }
            pos += n as u64;
        }

        let before = self.toc.len();
        for window in starts.windows(2) {
            self.toc.push(Span {
                start: window[0],
                end: window[1],
            });
        }
        if let Some(&last_start) = starts.last() {
            self.toc.push(Span {
                start: last_start,
                end: total_len,
            });
        }
        self.file_length = total_len;
        Ok(self.toc.len() - before)
    }

    fn persist(&self) -> Result<()> {
        write_snapshot(
            &self.snapshot_path,
            &Snapshot {
                toc: self.toc.clone(),
                file_length: self.file_length,
                last_parsed: self.last_parsed,
            },
        )
    }
}

fn read_line_bytes(reader: &mut impl std::io::BufRead, out: &mut Vec<u8>) -> Result<usize> {
    Ok(reader.read_until(b'\n', out)?)
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() < 4 {
        return Err(MailsieveError::CorruptedFile(path.to_path_buf()));
    }
    let (crc_bytes, payload) = bytes.split_at(4);
    let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    if crc32fast::hash(payload) != expected {
        return Err(MailsieveError::CorruptedFile(path.to_path_buf()));
    }
    let snapshot: Snapshot = bincode::deserialize(payload)?;
    Ok(Some(snapshot))
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let payload = bincode::serialize(snapshot)?;
    let crc = crc32fast::hash(&payload);
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);

    let tmp = path.with_extension("toc.tmp");
    std::fs::write(&tmp, &out)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
