//! Error types for the mailsieve indexing and search engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MailsieveError>;

#[derive(Error, Debug)]
pub enum MailsieveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("mailbox mutated: {0}")]
    MailboxMutated(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("shard IO error on {path}: {source}")]
    ShardIo {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("corrupted file: {0}")]
    CorruptedFile(std::path::PathBuf),
}

impl From<bincode::Error> for MailsieveError {
    fn from(err: bincode::Error) -> Self {
        MailsieveError::Serialization(err.to_string())
    }
}
