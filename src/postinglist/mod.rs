//! Sharded, hash-prefix-addressed posting list store.
//!
//! A directory of files; each filename is a 1..H character prefix of a
//! word's [`word_sig`]. Each file is a newline-delimited sequence of
//! records `<signature>\t<iid>\t<iid>...`, where every recorded signature
//! starts with the file's own name. For any word exactly one file is
//! authoritative: the longest existing prefix of its signature.
//!
//! Shards grow by plain appends and are split back down probabilistically
//! (see [`PostingStore::append`]) or deterministically during
//! [`PostingStore::optimize`]. There is no in-place delete marker:
//! removing an IID from a signature is a load/modify/save cycle.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;

use crate::error::{MailsieveError, Result};
use crate::fdcache::AppendFdCache;
use crate::hashing::{base36, from_base36, word_sig, HASH_LEN};
use crate::collab::Ui;

/// Default shard target size, in KiB, matching `postinglist_kb`'s default.
pub const DEFAULT_SHARD_KB: u64 = 60;

/// How coarsely [`PostingStore::optimize`] reports progress: once per shard.
const OPTIMIZE_PROGRESS_GRANULARITY: usize = 1;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Append the blob to whatever the file already holds.
    Append,
    /// Replace the file's contents with the blob (or remove it if empty).
    Truncate,
}

/// A directory of posting-list shards, rooted at `dir`.
pub struct PostingStore {
    dir: PathBuf,
    fd_cache: Arc<AppendFdCache>,
    shard_target_bytes: u64,
}

impl PostingStore {
    pub fn new(dir: impl Into<PathBuf>, shard_kb: u64, fd_cache: Arc<AppendFdCache>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            fd_cache,
            shard_target_bytes: shard_kb.max(1) * 1024,
        })
    }

    /// All IIDs recorded against `term`'s exact signature.
    pub fn hits(&self, term: &str) -> Result<BTreeSet<u64>> {
        let sig = word_sig(term);
        match self.locate(&sig, false)? {
            None => Ok(BTreeSet::new()),
            Some(prefix) => {
                let shard = self.load_shard(&prefix)?;
                Ok(shard.get(&sig).cloned().unwrap_or_default())
            }
        }
    }

    /// Append a single `(word, iid)` record: the fast path described in
    /// the shard store's append algorithm.
    ///
    /// With probability 1/50, when the target shard already exceeds
    /// `shard_target_bytes - 6*HASH_LEN`, this instead performs a full
    /// load/split/save cycle that folds the new record in, so oversize
    /// shards do not persist indefinitely.
    pub fn append(&self, word: &str, iid: u64) -> Result<()> {
        let sig = word_sig(word);
        let prefix = self.locate(&sig, true)?.expect("write mode always locates");
        let path = self.dir.join(&prefix);
        let slack = 6 * HASH_LEN as u64;
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        let over_threshold = size > self.shard_target_bytes.saturating_sub(slack);

        if over_threshold && roll_1_in_50() {
            log::debug!("postinglist: probabilistic split triggered for shard {prefix}");
            let mut shard = self.load_shard(&prefix)?;
            shard.entry(sig).or_default().insert(iid);
            self.save_shard(&mut shard, &prefix, WriteMode::Truncate)
        } else {
            let line = format!("{sig}\t{}\n", base36(iid));
            self.fd_cache.append(&path, line.as_bytes())
        }
    }

    /// Flush every cached append handle. Called after a metadata index
    /// save so both are durable at the same checkpoint.
    pub fn flush(&self) {
        self.fd_cache.flush_all();
    }

    /// Append the same word against multiple IIDs.
    pub fn append_many(&self, word: &str, iids: impl IntoIterator<Item = u64>) -> Result<()> {
        for iid in iids {
            self.append(word, iid)?;
        }
        Ok(())
    }

    /// Remove a single IID from a word's postings via load/modify/save.
    pub fn remove(&self, word: &str, iid: u64) -> Result<()> {
        let sig = word_sig(word);
        let prefix = self.locate(&sig, true)?.expect("write mode always locates");
        let mut shard = self.load_shard(&prefix)?;
        if let Some(set) = shard.get_mut(&sig) {
            set.remove(&iid);
        }
        self.save_shard(&mut shard, &prefix, WriteMode::Truncate)
    }

    /// Two-pass maintenance compaction over the whole shard directory.
    ///
    /// Pass 1 rewrites every shard whose size exceeds 90% of target,
    /// applying the split rule and dropping any IID `>= len_index` (a
    /// tombstone: an IID beyond the current metadata index length).
    /// Pass 2 walks shards longest-prefix-first and merges each into its
    /// longest existing strict prefix when the combined size still fits.
    ///
    /// Returns the number of shard files touched.
    pub fn optimize(&self, len_index: u64, ui: &dyn Ui) -> Result<usize> {
        let mut touched = 0usize;
        let mut names = self.shard_filenames()?;
        names.sort();

        for name in &names {
            let path = self.dir.join(name);
            let size = path.metadata().map(|m| m.len()).unwrap_or(0);
            if size <= (self.shard_target_bytes * 9) / 10 {
                continue;
            }
            let mut shard = self.load_shard(name)?;
            drop_tombstones(&mut shard, len_index);
            self.save_shard(&mut shard, name, WriteMode::Truncate)?;
            touched += 1;
            if touched % OPTIMIZE_PROGRESS_GRANULARITY == 0 {
                ui.mark(&format!("optimize: compacted shard {name}"));
            }
        }

        let mut names = self.shard_filenames()?;
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let slack = 6 * HASH_LEN as u64;

        for name in &names {
            let path = self.dir.join(name);
            if !path.exists() {
                continue;
            }
            let Some(parent) = self.longest_existing_strict_prefix(name)? else {
                continue;
            };
            let parent_path = self.dir.join(&parent);
            let size = path.metadata().map(|m| m.len()).unwrap_or(0);
            let parent_size = parent_path.metadata().map(|m| m.len()).unwrap_or(0);
            if size + parent_size >= self.shard_target_bytes.saturating_sub(slack) {
                continue;
            }
            let blob = fs::read(&path)?;
            self.fd_cache.append(&parent_path, &blob)?;
            self.fd_cache.evict(&path);
            fs::remove_file(&path)?;
            touched += 1;
            ui.mark(&format!("optimize: merged shard {name} into {parent}"));
        }

        Ok(touched)
    }

    fn shard_filenames(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    fn longest_existing_strict_prefix(&self, name: &str) -> Result<Option<String>> {
        let mut len = name.len();
        while len > 1 {
            len -= 1;
            let candidate: String = name.chars().take(len).collect();
            if self.dir.join(&candidate).exists() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Find the file authoritative for `sig`: the longest existing prefix
    /// of up to `HASH_LEN` characters. In write mode, if none exists, the
    /// single-character prefix file is created.
    fn locate(&self, sig: &str, create_if_missing: bool) -> Result<Option<String>> {
        let routed: String = sig.chars().take(HASH_LEN).collect();
        let mut len = routed.chars().count();
        loop {
            let candidate: String = routed.chars().take(len).collect();
            let path = self.dir.join(&candidate);
            if path.exists() {
                return Ok(Some(candidate));
            }
            if len == 1 {
                if create_if_missing {
                    File::create(&path)?;
                    return Ok(Some(candidate));
                }
                return Ok(None);
            }
            len -= 1;
        }
    }

    /// Parse every line of shard file `name` into an in-memory map of
    /// full signature -> set of IIDs. A missing file is an empty shard.
    fn load_shard(&self, name: &str) -> Result<HashMap<String, BTreeSet<u64>>> {
        let path = self.dir.join(name);
        let mut opts = OpenOptions::new();
        opts.read(true);
        let file = match self.fd_cache.open_fresh(&path, &opts) {
            Ok(f) => f,
            Err(MailsieveError::ShardIo { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e),
        };

        let mut shard: HashMap<String, BTreeSet<u64>> = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split('\t');
            let Some(sig) = parts.next() else { continue };
            let set = shard.entry(sig.to_string()).or_default();
            for iid_text in parts {
                match from_base36(iid_text) {
                    Some(iid) => {
                        set.insert(iid);
                    }
                    None => log::warn!("postinglist: skipping malformed iid {iid_text:?} in shard {name}"),
                }
            }
        }
        Ok(shard)
    }

    /// Rewrite/split: the non-trivial part of the shard store.
    ///
    /// Recomputes the blob of lines whose signature starts with `prefix`;
    /// while that blob exceeds `shard_target_bytes` and `prefix` is
    /// shorter than `HASH_LEN`, picks the signature with the most IIDs
    /// (ties broken lexicographically), extends it by one character, and
    /// recursively writes everything sharing that longer prefix out to
    /// its own file before recomputing. Idempotent: running this twice
    /// over the same map moves no further data.
    fn save_shard(&self, shard: &mut HashMap<String, BTreeSet<u64>>, prefix: &str, mode: WriteMode) -> Result<()> {
        let mut blob = format_shard(shard, prefix);

        while blob.len() as u64 > self.shard_target_bytes && prefix.chars().count() < HASH_LEN {
            let Some(hotspot) = pick_hotspot(shard, prefix) else {
                break;
            };
            let new_prefix: String = hotspot.chars().take(prefix.chars().count() + 1).collect();
            self.save_shard(shard, &new_prefix, WriteMode::Append)?;
            shard.retain(|sig, _| !sig.starts_with(&new_prefix));
            blob = format_shard(shard, prefix);
        }

        self.write_shard_file(prefix, &blob, mode)
    }

    fn write_shard_file(&self, prefix: &str, blob: &[u8], mode: WriteMode) -> Result<()> {
        let path = self.dir.join(prefix);
        if blob.is_empty() {
            if path.exists() {
                self.fd_cache.evict(&path);
                fs::remove_file(&path)?;
            }
            return Ok(());
        }
        match mode {
            WriteMode::Append => self.fd_cache.append(&path, blob),
            WriteMode::Truncate => {
                let mut opts = OpenOptions::new();
                opts.write(true).create(true).truncate(true);
                let mut file = self.fd_cache.open_fresh(&path, &opts)?;
                file.write_all(blob).map_err(|source| MailsieveError::ShardIo {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
}

impl crate::query::HitSource for PostingStore {
    fn hits_for_term(&self, term: &str) -> Result<BTreeSet<u64>> {
        self.hits(term)
    }
}

fn roll_1_in_50() -> bool {
    rand::thread_rng().gen_range(0..50) == 0
}

fn drop_tombstones(shard: &mut HashMap<String, BTreeSet<u64>>, len_index: u64) {
    for set in shard.values_mut() {
        set.retain(|&iid| iid < len_index);
    }
}

/// The signature (among those starting with `prefix`) backed by the most
/// IIDs. Ties go to the lexicographically smaller signature, for a
/// deterministic, idempotent split.
fn pick_hotspot(shard: &HashMap<String, BTreeSet<u64>>, prefix: &str) -> Option<String> {
    shard
        .iter()
        .filter(|(sig, set)| sig.starts_with(prefix) && !set.is_empty())
        .max_by(|(sig_a, set_a), (sig_b, set_b)| {
            set_a
                .len()
                .cmp(&set_b.len())
                .then_with(|| sig_b.cmp(sig_a))
        })
        .map(|(sig, _)| sig.clone())
}

/// Render every non-empty entry whose signature starts with `prefix` as
/// `<sig>\t<iid>\t<iid>...\n` lines, sorted by signature then IID for
/// deterministic, byte-identical re-writes.
fn format_shard(shard: &HashMap<String, BTreeSet<u64>>, prefix: &str) -> Vec<u8> {
    let mut sigs: Vec<&String> = shard
        .keys()
        .filter(|sig| sig.starts_with(prefix) && !shard[*sig].is_empty())
        .collect();
    sigs.sort();

    let mut out = Vec::new();
    for sig in sigs {
        out.extend_from_slice(sig.as_bytes());
        for iid in &shard[sig] {
            out.push(b'\t');
            out.extend_from_slice(base36(*iid).as_bytes());
        }
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::NullUi;

    fn store(shard_kb: u64) -> (tempfile::TempDir, PostingStore) {
        let dir = tempfile::tempdir().unwrap();
        let fd_cache = Arc::new(AppendFdCache::new(32));
        let store = PostingStore::new(dir.path(), shard_kb, fd_cache).unwrap();
        (dir, store)
    }

    #[test]
    fn append_then_hits_round_trips() {
        let (_dir, store) = store(DEFAULT_SHARD_KB);
        store.append("hello", 1).unwrap();
        store.append("hello", 2).unwrap();
        store.append("world", 3).unwrap();

        let hits = store.hits("hello").unwrap();
        assert_eq!(hits, BTreeSet::from([1, 2]));
        assert_eq!(store.hits("world").unwrap(), BTreeSet::from([3]));
        assert!(store.hits("absent").unwrap().is_empty());
    }

    #[test]
    fn remove_drops_single_iid() {
        let (_dir, store) = store(DEFAULT_SHARD_KB);
        store.append("hello", 1).unwrap();
        store.append("hello", 2).unwrap();
        store.remove("hello", 1).unwrap();
        assert_eq!(store.hits("hello").unwrap(), BTreeSet::from([2]));
    }

    #[test]
    fn every_shard_line_signature_has_file_prefix() {
        let (dir, store) = store(1);
        for i in 0..2000u64 {
            store.append(&format!("word{i}"), i).unwrap();
        }
        store.optimize(u64::MAX, &NullUi).unwrap();

        for entry in fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().into_string().unwrap();
            let content = fs::read_to_string(entry.path()).unwrap();
            for line in content.lines() {
                let sig = line.split('\t').next().unwrap();
                assert!(sig.starts_with(&name), "{sig} does not start with shard {name}");
            }
        }
    }

    #[test]
    fn split_trigger_keeps_shards_near_target() {
        let (_dir, store) = store(1);
        for i in 0..5000u64 {
            store.append("foo", i).unwrap();
        }
        store.optimize(u64::MAX, &NullUi).unwrap();

        let mut names = store.shard_filenames().unwrap();
        names.sort();
        assert!(names.iter().any(|n| n.len() >= 2));
        for name in &names {
            let size = store.dir.join(name).metadata().unwrap().len();
            assert!(size <= store.shard_target_bytes + 64, "shard {name} is {size} bytes");
        }
    }

    #[test]
    fn optimize_twice_is_idempotent() {
        let (_dir, store) = store(1);
        for i in 0..3000u64 {
            store.append("bar", i).unwrap();
        }
        store.optimize(u64::MAX, &NullUi).unwrap();

        let mut before = HashMap::new();
        for name in store.shard_filenames().unwrap() {
            before.insert(name.clone(), fs::read(store.dir.join(&name)).unwrap());
        }

        store.optimize(u64::MAX, &NullUi).unwrap();

        let mut after = HashMap::new();
        for name in store.shard_filenames().unwrap() {
            after.insert(name.clone(), fs::read(store.dir.join(&name)).unwrap());
        }

        assert_eq!(before, after);
    }

    #[test]
    fn optimize_drops_tombstoned_iids() {
        let (_dir, store) = store(DEFAULT_SHARD_KB);
        store.append("hello", 1).unwrap();
        store.append("hello", 100).unwrap();

        let path = store.dir.join(store.locate(&word_sig("hello"), false).unwrap().unwrap());
        let size_before = path.metadata().unwrap().len();
        assert!(size_before > 0);

        store.optimize(10, &NullUi).unwrap();
        assert_eq!(store.hits("hello").unwrap(), BTreeSet::from([1]));
    }

    #[test]
    fn missing_shard_is_not_an_error() {
        let (_dir, store) = store(DEFAULT_SHARD_KB);
        assert!(store.hits("never-indexed").unwrap().is_empty());
    }
}
