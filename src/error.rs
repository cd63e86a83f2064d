//! Crate-wide error type.
//!
//! Low-level I/O failures are never swallowed, structural mount failures are
//! distinguished from allocation failures, and path-operation failures carry
//! enough context to be actionable.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error at offset {offset}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("bad format: {0}")]
    BadFormat(String),

    #[error("inconsistent filesystem: {0}")]
    InconsistentFs(String),

    #[error("out of space: requested {requested} clusters, {available} available")]
    NoSpace { requested: u32, available: u32 },

    #[error("root directory is full")]
    DirFull,

    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("volume is read-only")]
    ReadOnly,

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn io(offset: u64, source: std::io::Error) -> Self {
        Error::Io { offset, source }
    }
}
