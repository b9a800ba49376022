//! Mail metadata index: the message record (MR) array and its secondary
//! lookup tables.
//!
//! MRs are append-only; PTR, SIZE, TAGS, and REPLIES are the only
//! fields ever mutated after the fact, and only in place. Rows are kept
//! on disk (and in memory) as tab-delimited text lines, decoded lazily
//! and cached behind a bounded LRU so hot rows avoid a re-parse.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{MailsieveError, Result};
use crate::hashing::{base36, from_base36};
use crate::postinglist::PostingStore;

const ROW_CACHE_CAPACITY: usize = 4096;

/// One message's metadata row. Field order matches the on-disk encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub iid: u64,
    pub ptr: String,
    pub size: u64,
    pub mid: String,
    pub date: u64,
    pub from: String,
    pub subject: String,
    pub tags: Vec<String>,
    pub replies: Vec<u64>,
    pub conv: u64,
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

impl MessageRecord {
    pub fn encode(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            base36(self.iid),
            self.ptr,
            base36(self.size),
            self.mid,
            base36(self.date),
            sanitize(&self.from),
            sanitize(&self.subject),
            self.tags.join(","),
            self.replies.iter().map(|r| base36(*r)).collect::<Vec<_>>().join(","),
            base36(self.conv),
        )
    }

    pub fn decode(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() != 10 {
            return Err(MailsieveError::InvalidData(format!(
                "message record has {} fields, expected 10: {line:?}",
                parts.len()
            )));
        }
        let field = |s: &str| -> Result<u64> {
            from_base36(s).ok_or_else(|| MailsieveError::InvalidData(format!("bad base36 field {s:?}")))
        };
        let csv_ids = |s: &str| -> Result<Vec<u64>> {
            s.split(',').filter(|p| !p.is_empty()).map(field).collect()
        };

        Ok(Self {
            iid: field(parts[0])?,
            ptr: parts[1].to_string(),
            size: field(parts[2])?,
            mid: parts[3].to_string(),
            date: field(parts[4])?,
            from: parts[5].to_string(),
            subject: parts[6].to_string(),
            tags: parts[7].split(',').filter(|s| !s.is_empty()).map(str::to_string).collect(),
            replies: csv_ids(parts[8])?,
            conv: field(parts[9])?,
        })
    }
}

/// The MR array plus PTR/MID secondary maps and a bounded cache of
/// decoded rows.
pub struct MailIndex {
    path: PathBuf,
    lines: Vec<String>,
    by_ptr: HashMap<String, u64>,
    by_mid: HashMap<String, u64>,
    cache: Mutex<LruCache<u64, Arc<MessageRecord>>>,
}

impl MailIndex {
    /// Create an empty index backed by `path` (not yet written).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lines: Vec::new(),
            by_ptr: HashMap::new(),
            by_mid: HashMap::new(),
            cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(ROW_CACHE_CAPACITY).unwrap())),
        }
    }

    /// Load `path`, skipping blank and `#`-prefixed lines.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut index = Self::new(&path);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e.into()),
        };

        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            index.lines.push(line.to_string());
        }
        index.update_secondary()?;
        Ok(index)
    }

    pub fn len(&self) -> u64 {
        self.lines.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Write a header comment plus every MR, one per line, via
    /// write-temp-then-rename, then flush the posting store so both are
    /// durable at the same checkpoint.
    pub fn save(&self, postings: &PostingStore) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::from("# mailsieve metadata index\n");
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, &self.path)?;
        postings.flush();
        Ok(())
    }

    /// Rebuild `PTR -> IID` and `MID -> IID` from the current MRs.
    pub fn update_secondary(&mut self) -> Result<()> {
        self.by_ptr.clear();
        self.by_mid.clear();
        for i in 0..self.lines.len() {
            let mr = self.decode_line(i as u64)?;
            self.by_ptr.insert(mr.ptr.clone(), i as u64);
            self.by_mid.insert(mr.mid.clone(), i as u64);
        }
        Ok(())
    }

    pub fn iid_for_ptr(&self, ptr: &str) -> Option<u64> {
        self.by_ptr.get(ptr).copied()
    }

    /// True if the PTR map hasn't been (re)built yet, e.g. right after
    /// [`Self::new`] on a fresh index with no `load` call.
    pub fn ptr_map_is_empty(&self) -> bool {
        self.by_ptr.is_empty() && !self.lines.is_empty()
    }

    pub fn iid_for_mid(&self, mid: &str) -> Option<u64> {
        self.by_mid.get(mid).copied()
    }

    fn decode_line(&self, iid: u64) -> Result<Arc<MessageRecord>> {
        if let Some(cached) = self.cache.lock().get(&iid) {
            return Ok(cached.clone());
        }
        let line = self
            .lines
            .get(iid as usize)
            .ok_or_else(|| MailsieveError::InvalidData(format!("no such message iid {iid}")))?;
        let mr = Arc::new(MessageRecord::decode(line)?);
        self.cache.lock().put(iid, mr.clone());
        Ok(mr)
    }

    pub fn get(&self, iid: u64) -> Result<Arc<MessageRecord>> {
        self.decode_line(iid)
    }

    pub fn get_replies(&self, iid: u64) -> Result<Vec<u64>> {
        Ok(self.get(iid)?.replies.clone())
    }

    pub fn get_tags(&self, iid: u64) -> Result<Vec<String>> {
        Ok(self.get(iid)?.tags.clone())
    }

    /// All IIDs in `iid`'s conversation: its root plus every descendant
    /// reachable by walking REPLIES transitively.
    pub fn get_conversation(&self, iid: u64) -> Result<Vec<u64>> {
        let root = self.get(iid)?.conv;
        self.transitive_replies(root)
    }

    fn transitive_replies(&self, root: u64) -> Result<Vec<u64>> {
        let mut out = vec![root];
        let mut stack = vec![root];
        while let Some(cur) = stack.pop() {
            for &child in &self.get(cur)?.replies {
                out.push(child);
                stack.push(child);
            }
        }
        Ok(out)
    }

    fn replace(&mut self, iid: u64, mr: MessageRecord) -> Result<()> {
        self.lines[iid as usize] = mr.encode();
        self.cache.lock().put(iid, Arc::new(mr));
        Ok(())
    }

    /// Append a brand new message. `conv` should be `iid` itself for a
    /// conversation root, or an existing root's IID for a reply (the
    /// caller must also register the reply with [`Self::add_reply`]).
    #[allow(clippy::too_many_arguments)]
    pub fn add_message(
        &mut self,
        ptr: String,
        size: u64,
        mid: String,
        date: u64,
        from: String,
        subject: String,
        tags: Vec<String>,
        conv: u64,
    ) -> Result<u64> {
        let iid = self.lines.len() as u64;
        let mr = MessageRecord {
            iid,
            ptr: ptr.clone(),
            size,
            mid: mid.clone(),
            date,
            from,
            subject,
            tags,
            replies: Vec::new(),
            conv,
        };
        self.lines.push(mr.encode());
        self.cache.lock().put(iid, Arc::new(mr));
        self.by_ptr.insert(ptr, iid);
        self.by_mid.insert(mid, iid);
        Ok(iid)
    }

    /// Register `child` as a direct reply of `root`.
    pub fn add_reply(&mut self, root: u64, child: u64) -> Result<()> {
        let mut mr = (*self.get(root)?).clone();
        mr.replies.push(child);
        self.replace(root, mr)
    }

    /// Update PTR and SIZE for a message that moved within its mailbox.
    pub fn update_ptr_and_size(&mut self, iid: u64, new_ptr: String, new_size: u64) -> Result<()> {
        let mut mr = (*self.get(iid)?).clone();
        self.by_ptr.remove(&mr.ptr);
        mr.ptr = new_ptr.clone();
        mr.size = new_size;
        self.by_ptr.insert(new_ptr, iid);
        self.replace(iid, mr)
    }

    /// Tag `iids` and every message transitively reachable through their
    /// REPLIES, updating each MR's TAGS and the `<tag_id>:tag` posting
    /// list. Idempotent.
    pub fn add_tag(&mut self, tag_id: &str, iids: &[u64], postings: &PostingStore) -> Result<()> {
        let targets = self.tag_targets(iids)?;
        for iid in targets {
            let mut mr = (*self.get(iid)?).clone();
            if !mr.tags.iter().any(|t| t == tag_id) {
                mr.tags.push(tag_id.to_string());
                self.replace(iid, mr)?;
                postings.append(&format!("{tag_id}:tag"), iid)?;
            }
        }
        Ok(())
    }

    /// Inverse of [`Self::add_tag`].
    pub fn remove_tag(&mut self, tag_id: &str, iids: &[u64], postings: &PostingStore) -> Result<()> {
        let targets = self.tag_targets(iids)?;
        for iid in targets {
            let mut mr = (*self.get(iid)?).clone();
            if let Some(pos) = mr.tags.iter().position(|t| t == tag_id) {
                mr.tags.remove(pos);
                self.replace(iid, mr)?;
                postings.remove(&format!("{tag_id}:tag"), iid)?;
            }
        }
        Ok(())
    }

    fn tag_targets(&self, iids: &[u64]) -> Result<BTreeSet<u64>> {
        let mut targets = BTreeSet::new();
        for &iid in iids {
            targets.extend(self.transitive_replies(iid)?);
        }
        Ok(targets)
    }
}

impl crate::query::SortKeys for MailIndex {
    fn date(&self, iid: u64) -> i64 {
        self.get(iid).map(|mr| mr.date as i64).unwrap_or(0)
    }

    fn from(&self, iid: u64) -> String {
        self.get(iid).map(|mr| mr.from.clone()).unwrap_or_default()
    }

    fn subject(&self, iid: u64) -> String {
        self.get(iid).map(|mr| mr.subject.clone()).unwrap_or_default()
    }

    fn conv(&self, iid: u64) -> u64 {
        self.get(iid).map(|mr| mr.conv).unwrap_or(iid)
    }
}
