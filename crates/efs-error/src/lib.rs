#![forbid(unsafe_code)]
//! Error types for ExtentFS.
//!
//! Defines `EfsError` and a `Result<T>` alias used throughout the workspace.

use efs_types::ParseError;
use thiserror::Error;

/// Unified error type for all ExtentFS operations.
#[derive(Debug, Error)]
pub enum EfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corrupt { block: u64, detail: String },

    #[error("no space left on device")]
    NoSpace,

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    Exists(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),

    #[error("bad file descriptor: {0}")]
    BadDescriptor(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl EfsError {
    /// Wrap a codec failure as corruption at a known block.
    #[must_use]
    pub fn corrupt_at(block: u64, err: &ParseError) -> Self {
        Self::Corrupt {
            block,
            detail: err.to_string(),
        }
    }
}

impl From<ParseError> for EfsError {
    fn from(err: ParseError) -> Self {
        Self::Corrupt {
            block: 0,
            detail: err.to_string(),
        }
    }
}

/// Result alias using `EfsError`.
pub type Result<T> = std::result::Result<T, EfsError>;
