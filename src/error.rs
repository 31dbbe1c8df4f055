//! Error types for the store, mirroring the failure-kind table of the
//! engine's error-handling design: each surfaced failure maps to one
//! variant rather than a bare string.

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TmstatError>;

#[derive(thiserror::Error, Debug)]
pub enum TmstatError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    #[error("segment corrupt: {0}")]
    SegmentCorrupt(String),

    #[error("segment damaged: {0}")]
    SegmentDamaged(String),

    #[error("table not found: {0}")]
    NoSuchTable(String),

    #[error("column not found: {0}")]
    NoSuchColumn(String),

    #[error("path error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    PlainIo(#[from] std::io::Error),
}

impl TmstatError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TmstatError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        TmstatError::InvalidArgument(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        TmstatError::SegmentCorrupt(msg.into())
    }

    pub fn damaged(msg: impl Into<String>) -> Self {
        TmstatError::SegmentDamaged(msg.into())
    }
}
