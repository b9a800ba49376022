//! Append-FD cache
//!
//! Indexing is append-heavy, and a handful of shard files are appended to
//! far more often than others. This is a bounded LRU pool of open append
//! handles so the shard store doesn't pay `open()`/`close()` for every
//! single line it writes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{MailsieveError, Result};

/// Default capacity, matching the reference implementation's default.
pub const DEFAULT_CAPACITY: usize = 500;

/// Bounded pool of open append handles, keyed by path.
///
/// Only append handles are cached. Reads and truncating writes always get a
/// fresh handle, and evict any cached append handle for the same path first
/// (so a reader never sees a stale buffered append fd race against its own
/// open of the same file).
pub struct AppendFdCache {
    inner: Mutex<LruCache<PathBuf, File>>,
}

impl AppendFdCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Append `line` to `path`, reusing a cached handle when possible.
    ///
    /// On a persistent "too many open files" style failure, evicts 30% of
    /// the cache and retries once before giving up with
    /// [`MailsieveError::ResourceExhausted`].
    pub fn append(&self, path: &Path, line: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock();
        if let Some(file) = guard.get_mut(path) {
            return write_all(file, path, line);
        }

        if guard.len() >= guard.cap().get() {
            guard.pop_lru();
        }

        match open_append(path) {
            Ok(mut file) => {
                write_all(&mut file, path, line)?;
                guard.put(path.to_path_buf(), file);
                Ok(())
            }
            Err(_) => {
                let evict = (guard.len() as f64 * 0.3).ceil() as usize;
                evict_n(&mut guard, evict.max(1));
                let mut file = open_append(path).map_err(|e| {
                    MailsieveError::ResourceExhausted(format!(
                        "cannot open {} for append after evicting cache: {e}",
                        path.display()
                    ))
                })?;
                write_all(&mut file, path, line)?;
                guard.put(path.to_path_buf(), file);
                Ok(())
            }
        }
    }

    /// Open `path` fresh in the given mode (not append). Evicts any cached
    /// append handle for the same path first so the two never alias.
    pub fn open_fresh(&self, path: &Path, options: &OpenOptions) -> Result<File> {
        let mut guard = self.inner.lock();
        guard.pop(path);
        drop(guard);
        options
            .open(path)
            .map_err(|source| MailsieveError::ShardIo {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Drop a cached handle for `path`, if any, without touching the file.
    pub fn evict(&self, path: &Path) {
        self.inner.lock().pop(path);
    }

    /// Close the oldest `count` cached handles.
    pub fn flush_count(&self, count: usize) {
        evict_n(&mut self.inner.lock(), count);
    }

    /// Close the oldest `ratio` fraction of cached handles (0.0..=1.0).
    pub fn flush_ratio(&self, ratio: f64) {
        let mut guard = self.inner.lock();
        let count = (guard.len() as f64 * ratio).ceil() as usize;
        evict_n(&mut guard, count);
    }

    /// Close every cached handle.
    pub fn flush_all(&self) {
        self.inner.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

fn evict_n(cache: &mut LruCache<PathBuf, File>, count: usize) {
    for _ in 0..count {
        if cache.pop_lru().is_none() {
            break;
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_all(file: &mut File, path: &Path, line: &[u8]) -> Result<()> {
    file.write_all(line).map_err(|source| MailsieveError::ShardIo {
        path: path.to_path_buf(),
        source,
    })
}
