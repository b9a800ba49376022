//! mailsieve
//!
//! A personal, offline full-text search engine over local mbox mail
//! archives: incremental scanning, a sharded on-disk posting-list store,
//! and boolean keyword search with conversation threading.
//!
//! The core never touches a terminal or a config file directly — see
//! [`collab`] for the two narrow traits ([`collab::Ui`], [`collab::Config`])
//! an embedder implements to plug this crate into an application.

pub mod collab;
pub mod error;
pub mod fdcache;
pub mod filters;
pub mod hashing;
pub mod mbox;
pub mod metadata;
pub mod postinglist;
pub mod query;
pub mod scanner;
pub mod tokenizer;

pub use collab::{Config, FilterRule, TagOp, Ui};
pub use error::{MailsieveError, Result};
pub use mbox::MboxReader;
pub use metadata::{MailIndex, MessageRecord};
pub use postinglist::PostingStore;
