//! The store's public error type.
//!
//! Three kinds are distinguished: caller contract violations
//! ([`StoreError::InvalidArgument`]), state violations (closed store,
//! read-only store, corruption, unsupported formats), and I/O failures
//! carrying the file name and offset they happened at.

use btree::TreeError;
use format::FormatError;
use thiserror::Error;

/// Errors surfaced by [`crate::Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller violated an API contract (unknown version, duplicate tree
    /// name, oversized key, renaming the meta tree, …).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store has been closed.
    #[error("this store is closed")]
    Closed,

    /// A mutating operation was attempted on a read-only store.
    #[error("this store is read-only")]
    ReadOnly,

    /// Another process (or another open in this process) holds the file lock.
    #[error("the file is locked: {0}")]
    Locked(String),

    /// No header copy passed its checksum.
    #[error("file header is corrupt")]
    CorruptHeader,

    /// An internal invariant failed while reading or updating store state.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// The file's read format is newer than this build understands; the file
    /// cannot be opened at all.
    #[error("the file read format {format} is newer than the supported format {supported}")]
    UnsupportedReadFormat { format: u64, supported: u64 },

    /// A page-level failure bubbled up from the tree layer.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// A shared codec rejected on-disk bytes.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// A positioned read, write, truncate, or sync failed.
    #[error("io error on {file} at offset {offset}: {source}")]
    Io {
        file: String,
        offset: u64,
        #[source]
        source: std::io::Error,
    },
}
