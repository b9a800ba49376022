//! Collaborator contracts.
//!
//! The core never touches a terminal, a config file, or a CLI argument
//! parser directly. It talks to two narrow traits instead: [`Ui`] (ask
//! the embedder to surface progress or a message) and [`Config`] (ask
//! the embedder for tuning knobs, mailbox lists, filter rules, and tag
//! names). [`InMemoryConfig`] and [`RecordingUi`] are reference/test
//! implementations; a real application or a `config.rc` reader is
//! expected to provide its own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::mbox::MboxReader;

/// Everything the core needs to say to a user, without knowing how.
///
/// The core never writes to stdio directly; every user-visible message
/// goes through one of these five calls.
pub trait Ui {
    /// Coarse-grained progress during a long operation (scan, optimize).
    fn mark(&self, progress: &str);
    /// A recoverable problem the user should know about.
    fn warning(&self, msg: &str);
    /// An operation-aborting problem.
    fn error(&self, msg: &str);
    /// An asynchronous notification unrelated to the caller's current call.
    fn notify(&self, msg: &str);
    /// Plain informational text.
    fn say(&self, text: &str);
}

/// A `Ui` that discards everything. Useful for tests and headless use.
pub struct NullUi;

impl Ui for NullUi {
    fn mark(&self, _progress: &str) {}
    fn warning(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
    fn notify(&self, _msg: &str) {}
    fn say(&self, _text: &str) {}
}

/// A `Ui` that records every call, in order, for test assertions.
#[derive(Default)]
pub struct RecordingUi {
    calls: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, kind: &str, msg: &str) {
        self.calls.lock().unwrap().push(format!("{kind}: {msg}"));
    }
}

impl Ui for RecordingUi {
    fn mark(&self, progress: &str) {
        self.record("mark", progress);
    }
    fn warning(&self, msg: &str) {
        self.record("warning", msg);
    }
    fn error(&self, msg: &str) {
        self.record("error", msg);
    }
    fn notify(&self, msg: &str) {
        self.record("notify", msg);
    }
    fn say(&self, text: &str) {
        self.record("say", text);
    }
}

/// A single filter rule: either match every message (`terms: None`, the
/// `*` rule) or match a boolean query, and apply a list of tag mutations
/// to whatever matches.
#[derive(Clone, Debug)]
pub struct FilterRule {
    pub id: String,
    pub terms: Option<String>,
    pub tag_ops: Vec<TagOp>,
}

/// A signed tag reference inside a filter rule (`+inbox`, `-spam`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagOp {
    Add(String),
    Remove(String),
}

/// Everything the core learns about its environment through one trait.
///
/// Mailbox ids are 3-character, zero-padded base36 strings.
pub trait Config {
    fn get_int(&self, key: &str, default: i64) -> i64;
    fn get_str(&self, key: &str, default: &str) -> String;

    /// Root directory for this profile's on-disk state.
    fn workdir(&self) -> PathBuf;
    /// Path to the metadata index file.
    fn mailindex_file(&self) -> PathBuf;
    /// Root directory of the posting-list shard store.
    fn postinglist_dir(&self) -> PathBuf;
    /// Path for a given mailbox's persisted TOC snapshot.
    fn mbox_snapshot_path(&self, mailbox_id: &str) -> PathBuf;

    /// Filter rules, in application order.
    fn get_filters(&self) -> Vec<FilterRule>;
    /// Mailboxes to scan, in scan order, as `(mailbox_id, path)`.
    fn get_mailboxes(&self) -> Vec<(String, PathBuf)>;
    /// Open (or create) the reader for one configured mailbox.
    fn open_mailbox(&self, mailbox_id: &str, path: &Path) -> Result<MboxReader>;

    /// Tag id -> display name.
    fn tags(&self) -> HashMap<String, String>;
    /// Mailbox id -> path, for fast lookup outside scan order.
    fn mailbox_dict(&self) -> HashMap<String, PathBuf>;
}

/// A plain in-memory `Config`, suitable for embedding without a
/// `config.rc` file and for this crate's own tests.
#[derive(Default)]
pub struct InMemoryConfig {
    pub ints: HashMap<String, i64>,
    pub strs: HashMap<String, String>,
    pub workdir: PathBuf,
    pub filters: Vec<FilterRule>,
    pub mailboxes: Vec<(String, PathBuf)>,
    pub tags: HashMap<String, String>,
}

impl InMemoryConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            ..Self::default()
        }
    }

    pub fn with_int(mut self, key: &str, value: i64) -> Self {
        self.ints.insert(key.to_string(), value);
        self
    }

    pub fn with_mailbox(mut self, id: &str, path: impl Into<PathBuf>) -> Self {
        self.mailboxes.push((id.to_string(), path.into()));
        self
    }

    pub fn with_filter(mut self, rule: FilterRule) -> Self {
        self.filters.push(rule);
        self
    }
}

impl Config for InMemoryConfig {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.ints.get(key).copied().unwrap_or(default)
    }

    fn get_str(&self, key: &str, default: &str) -> String {
        self.strs.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    fn workdir(&self) -> PathBuf {
        self.workdir.clone()
    }

    fn mailindex_file(&self) -> PathBuf {
        self.workdir.join("mailindex")
    }

    fn postinglist_dir(&self) -> PathBuf {
        self.workdir.join("search")
    }

    fn mbox_snapshot_path(&self, mailbox_id: &str) -> PathBuf {
        self.workdir.join("mailboxes").join(format!("{mailbox_id}.toc"))
    }

    fn get_filters(&self) -> Vec<FilterRule> {
        self.filters.clone()
    }

    fn get_mailboxes(&self) -> Vec<(String, PathBuf)> {
        self.mailboxes.clone()
    }

    fn open_mailbox(&self, mailbox_id: &str, path: &Path) -> Result<MboxReader> {
        MboxReader::open(mailbox_id, path, self.mbox_snapshot_path(mailbox_id))
    }

    fn tags(&self) -> HashMap<String, String> {
        self.tags.clone()
    }

    fn mailbox_dict(&self) -> HashMap<String, PathBuf> {
        self.mailboxes.iter().cloned().collect()
    }
}
