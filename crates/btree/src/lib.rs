//! # BTree — copy-on-write pages and versioned trees
//!
//! The in-memory side of the TideKV storage format:
//!
//! - [`Page`] — one immutable B-tree node. Leaves hold key and value byte
//!   strings; internal pages hold separator keys plus child positions and
//!   per-child entry counts. Once a page is shared (behind an `Arc`) it is
//!   never mutated; every logical change clones the page and installs the
//!   clone in its parent, up to a new root.
//! - [`Tree`] — one ordered map: a current root, the history of earlier
//!   in-memory roots (one per version, for rollback), and a pluggable key
//!   comparator.
//! - [`Cursor`] — ordered iteration over a root, loading pages on demand.
//! - [`PageStore`] — what a tree needs from its host: reading pages by
//!   position, the freed-page ledger, the unsaved-page counter, and the
//!   split threshold. The store crate implements it; tests use a stub.
//!
//! Keys and values are opaque bytes. Typed codecs live with the caller; the
//! only capability a tree takes is the ordering.

mod cursor;
mod page;
mod tree;

pub use cursor::Cursor;
pub use page::{write_unsaved_recursive, Page, WriteStats};
pub use tree::Tree;

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by tree and page operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A page failed structural validation or its check value did not match
    /// the position it was read from.
    #[error("corrupt page at position {pos:#x}: {reason}")]
    CorruptPage { pos: u64, reason: &'static str },

    /// A page position referenced a chunk that no longer exists.
    #[error("chunk {0} not found")]
    ChunkNotFound(u32),

    /// A mutation was attempted on a read-only tree (a historical snapshot).
    #[error("tree is read-only")]
    ReadOnly,

    /// An underlying positioned read failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A varint or other shared format inside a page was malformed.
    #[error(transparent)]
    Format(#[from] format::FormatError),
}

/// Ordering capability injected at tree construction.
///
/// Implementations compare the caller's *encoded* keys; the default is plain
/// lexicographic byte order.
pub trait KeyComparator: Send + Sync {
    /// Total order over encoded keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic (memcmp) byte ordering, the default for new trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicographicOrder;

impl KeyComparator for LexicographicOrder {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Host-side services a tree operates against.
///
/// Reads go through `&self` so cursors and historical snapshots can share
/// the store; mutation bookkeeping takes `&mut self` and is serialized by
/// the single-writer discipline of the store.
pub trait PageStore {
    /// Loads the page at `pos`, consulting the page cache first.
    ///
    /// `map_id` is the id the caller expects the page to belong to; a
    /// mismatch is corruption.
    fn read_page(&self, map_id: u32, pos: u64) -> Result<Arc<Page>, TreeError>;

    /// Records that the page at `pos` is no longer referenced by the newest
    /// version. Position `0` (an unsaved page) only adjusts the unsaved-page
    /// counter; a real position is evicted from the cache and charged to the
    /// freed-page ledger of the current version.
    fn remove_page(&mut self, pos: u64);

    /// Bumps the (approximate) count of unsaved in-memory pages.
    fn register_unsaved_page(&mut self);

    /// Offers a freshly serialized page to the cache under its new position.
    fn cache_written_page(&mut self, pos: u64, page: &Arc<Page>);

    /// In-memory size above which a page is split on write.
    fn page_split_size(&self) -> usize;

    /// The version new mutations are tagged with (the store's current
    /// version).
    fn write_version(&self) -> u64;
}
