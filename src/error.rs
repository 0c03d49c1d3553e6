//! Error types for seqtree.
//!
//! Operations report exactly five kinds of failure: a key that is not
//! present, a key that already is, an exhausted key range (hole search), an
//! I/O failure from the block store, and an integrity violation (a reference
//! or block that does not look the way the tree shape says it must). Nothing
//! is retried internally; callers decide.

use thiserror::Error;

/// Unified error type for all tree and block-manager operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    Exists,

    #[error("no missing key in range")]
    NoSpace,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("integrity: {0}")]
    Integrity(String),
}

impl Error {
    pub(crate) fn integrity(detail: impl Into<String>) -> Self {
        Self::Integrity(detail.into())
    }
}

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
