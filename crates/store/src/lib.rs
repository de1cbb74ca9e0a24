//! # Store — TideKV's single-file chunk store
//!
//! A persistent store of versioned ordered maps (trees) in one file, laid
//! out as append-mostly copy-on-write *chunks*:
//!
//! ```text
//! [ block 0: file header copy A ]
//! [ block 1: file header copy B ]
//! [ chunk header | page | page | … | pad | trailing header block ]
//! [ chunk header | page | page | … | pad | trailing header block ]
//! ...
//! ```
//!
//! Every commit serializes all pages dirtied since the previous commit,
//! plus the meta tree that tracks chunks, tree roots, and names, into one
//! new chunk, written with a single positioned write. Recovery picks the
//! highest-version checksum-valid header among the two leading copies and
//! the trailing header blocks, so any prefix of the file ending at a valid
//! trailing block is openable.
//!
//! ## Module Responsibilities
//!
//! | Module       | Purpose                                                |
//! |--------------|--------------------------------------------------------|
//! | `lib.rs`     | `Store` struct, data path, accessors, `Debug`, `Drop`  |
//! | [`builder`]  | open-time configuration                                |
//! | [`recovery`] | header read/write, candidate selection, `read_meta`    |
//! | [`commit`]   | the commit pipeline, allocator, shrink, freed ledger   |
//! | [`compact`]  | rewriting live keys out of under-utilized chunks       |
//! | [`version`]  | known versions, historical snapshots                   |
//! | [`rollback`] | reverting to an earlier version                        |
//!
//! ## Durability
//!
//! A commit never calls fsync on its own; the retention window keeps dead
//! chunk bytes from being overwritten before the OS plausibly flushed them.
//! Call [`Store::sync`] when stronger guarantees are needed.

mod builder;
mod chunk;
mod commit;
mod compact;
mod error;
mod file;
mod recovery;
mod rollback;
mod trees;
mod version;

pub use btree::{Cursor, KeyComparator, LexicographicOrder, TreeError};
pub use builder::Builder;
pub use error::StoreError;
pub use version::TreeSnapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use btree::{Page, PageStore, Tree};
use format::pos as pagepos;
use pagecache::PageCache;

use crate::chunk::Chunk;
use crate::file::StoreFile;

use std::sync::Arc;

/// The block size (physical sector size) the file is laid out in. The file
/// header is written once per block in the two leading blocks.
pub const BLOCK_SIZE: u64 = 4096;

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Map id reserved for the meta tree.
pub(crate) const META_ID: u32 = 0;

/// Default read cache budget in MiB.
pub(crate) const DEFAULT_CACHE_MB: usize = 16;

/// Default in-memory page size above which pages split. Not a hard limit on
/// page size; a page with one huge entry can exceed it.
pub(crate) const DEFAULT_PAGE_SPLIT_SIZE: usize = 6 * 1024;

/// Default seconds a dead chunk is retained before its blocks may be
/// overwritten, covering worst-case OS write-back latency.
pub(crate) const DEFAULT_RETENTION_TIME: u64 = 45;

/// Opaque handle to an open tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) u32);

/// The pieces of store state the tree layer operates against.
///
/// Kept separate from [`Store`] so a tree borrowed out of the tree table
/// and the page plumbing can be borrowed at the same time.
pub(crate) struct StoreInner {
    pub(crate) file: StoreFile,
    pub(crate) cache: Mutex<PageCache<Arc<Page>>>,
    pub(crate) chunks: HashMap<u32, Chunk>,
    /// Pending live-byte decrements: version → chunk id → freed bytes.
    /// Applied at commit, truncated on rollback.
    pub(crate) freed: BTreeMap<u64, HashMap<u32, i64>>,
    pub(crate) current_version: u64,
    pub(crate) page_split_size: usize,
    pub(crate) unsaved_pages: u64,
}

impl StoreInner {
    fn lock_cache(&self) -> MutexGuard<'_, PageCache<Arc<Page>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn clear_cache(&self) {
        self.lock_cache().clear();
    }
}

impl PageStore for StoreInner {
    fn read_page(&self, map_id: u32, pos: u64) -> Result<Arc<Page>, TreeError> {
        if pos == 0 {
            return Err(TreeError::CorruptPage {
                pos,
                reason: "attempt to read the empty position",
            });
        }
        if let Some(page) = self.lock_cache().get(pos) {
            return Ok(Arc::clone(page));
        }
        let chunk_id = pagepos::chunk_id(pos);
        let chunk = self
            .chunks
            .get(&chunk_id)
            .ok_or(TreeError::ChunkNotFound(chunk_id))?;
        let file_pos = chunk.start + u64::from(pagepos::offset(pos));
        let available = self.file.size().saturating_sub(file_pos);
        let len = u64::from(pagepos::max_length(pos)).min(available) as usize;
        let bytes = self.file.read_at(file_pos, len)?;
        let page = Arc::new(Page::read(&bytes, pos, map_id)?);
        self.lock_cache().insert(pos, Arc::clone(&page), page.memory());
        Ok(page)
    }

    fn remove_page(&mut self, pos: u64) {
        // Unsaved pages only adjust the estimate; persisted pages are kept
        // on disk for historical reads and charged to the ledger instead.
        if pos == 0 {
            self.unsaved_pages = self.unsaved_pages.saturating_sub(1);
            return;
        }
        self.lock_cache().remove(pos);
        let chunk_id = pagepos::chunk_id(pos);
        let by_chunk = self.freed.entry(self.current_version).or_default();
        *by_chunk.entry(chunk_id).or_insert(0) += i64::from(pagepos::max_length(pos));
    }

    fn register_unsaved_page(&mut self) {
        self.unsaved_pages += 1;
    }

    fn cache_written_page(&mut self, pos: u64, page: &Arc<Page>) {
        self.lock_cache().insert(pos, Arc::clone(page), page.memory());
    }

    fn page_split_size(&self) -> usize {
        self.page_split_size
    }

    fn write_version(&self) -> u64 {
        self.current_version
    }
}

/// A persistent store of named, versioned ordered maps.
///
/// All mutating operations take `&mut self`; the store is single-writer by
/// construction. Reads, including cursors and historical snapshots, work
/// through `&self` and may be shared.
pub struct Store {
    pub(crate) inner: StoreInner,
    pub(crate) meta: Tree,
    pub(crate) trees: HashMap<u32, Tree>,
    /// Ids of trees (and the meta tree) with potentially unsaved changes.
    pub(crate) changed: HashSet<u32>,
    /// The textual file header, kept as a map between writes.
    pub(crate) header: BTreeMap<String, String>,
    pub(crate) file_name: PathBuf,
    pub(crate) root_chunk_start: u64,
    pub(crate) last_chunk_id: u32,
    pub(crate) last_map_id: u32,
    /// Seconds since the epoch when the file was created.
    pub(crate) creation_time: u64,
    pub(crate) retention_time: u64,
    pub(crate) reuse_space: bool,
    pub(crate) read_only: bool,
    pub(crate) closed: bool,
    /// Reused serialization buffer for commits.
    pub(crate) write_buffer: Vec<u8>,
    /// Open-time configuration, including retained unknown options.
    pub(crate) config: BTreeMap<String, String>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("file", &self.file_name)
            .field("version", &self.inner.current_version)
            .field("chunks", &self.inner.chunks.len())
            .field("trees", &self.trees.len())
            .field("last_chunk_id", &self.last_chunk_id)
            .field("read_only", &self.read_only)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Store {
    /// Opens (or creates) a store with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store, StoreError> {
        Builder::new().file_name(path).open()
    }

    // ---- data path -------------------------------------------------------

    /// Looks up `key` in `tree`.
    pub fn get(&self, tree: TreeId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        Ok(self.tree(tree)?.get(&self.inner, key)?)
    }

    /// Whether `key` is present in `tree`.
    pub fn contains_key(&self, tree: TreeId, key: &[u8]) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(self.tree(tree)?.contains_key(&self.inner, key)?)
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn put(
        &mut self,
        tree: TreeId,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_writable()?;
        check_entry_sizes(key, Some(value))?;
        let t = self
            .trees
            .get_mut(&tree.0)
            .ok_or_else(unknown_tree)?;
        let old = t.put(&mut self.inner, key, value)?;
        self.changed.insert(tree.0);
        Ok(old)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, tree: TreeId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_writable()?;
        check_entry_sizes(key, None)?;
        let t = self
            .trees
            .get_mut(&tree.0)
            .ok_or_else(unknown_tree)?;
        let old = t.remove(&mut self.inner, key)?;
        self.changed.insert(tree.0);
        Ok(old)
    }

    /// Number of entries in `tree`.
    pub fn len(&self, tree: TreeId) -> Result<u64, StoreError> {
        self.check_open()?;
        Ok(self.tree(tree)?.len())
    }

    /// Whether `tree` holds no entries.
    pub fn is_empty(&self, tree: TreeId) -> Result<bool, StoreError> {
        Ok(self.len(tree)? == 0)
    }

    /// Ordered iteration over all entries of `tree`.
    pub fn iter(&self, tree: TreeId) -> Result<Cursor<'_>, StoreError> {
        self.check_open()?;
        Ok(self.tree(tree)?.iter(&self.inner)?)
    }

    /// Ordered iteration starting at the first key at or after `from`.
    pub fn iter_from(&self, tree: TreeId, from: &[u8]) -> Result<Cursor<'_>, StoreError> {
        self.check_open()?;
        Ok(self.tree(tree)?.iter_from(&self.inner, from)?)
    }

    // ---- versions and lifecycle -----------------------------------------

    /// The current version. A freshly created store is at version 0.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.inner.current_version
    }

    /// Advances the version without committing, opening a new in-memory
    /// version that [`Store::rollback_to`] can later return to.
    pub fn increment_version(&mut self) -> u64 {
        self.inner.current_version += 1;
        self.inner.current_version
    }

    /// Whether any tree (or the meta tree) carries uncommitted changes.
    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        if self.closed {
            return false;
        }
        self.changed.iter().any(|id| {
            *id == META_ID
                || self
                    .trees
                    .get(id)
                    .is_some_and(|t| t.has_unsaved_changes())
        })
    }

    /// Closes the store. Uncommitted changes are discarded; trailing free
    /// space is truncated.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.close_inner(true)
    }

    pub(crate) fn close_inner(&mut self, shrink: bool) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if shrink && !self.read_only {
            self.shrink_file_if_possible(0)?;
        }
        self.inner.clear_cache();
        self.inner.chunks.clear();
        self.inner.freed.clear();
        self.trees.clear();
        self.changed.clear();
        Ok(())
    }

    /// Flushes the backing file to stable storage. Commits never fsync on
    /// their own.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.check_open()?;
        self.inner.file.sync().map_err(|e| self.io_error(0, e))
    }

    // ---- settings and introspection -------------------------------------

    /// Seconds a dead chunk is retained before its space may be reused.
    #[must_use]
    pub fn retention_time(&self) -> u64 {
        self.retention_time
    }

    /// Sets the retention window. 0 reuses dead chunks as early as possible;
    /// the default (45 s) assumes the OS flushes write buffers at least that
    /// often. Not persisted.
    pub fn set_retention_time(&mut self, seconds: u64) {
        self.retention_time = seconds;
    }

    /// Whether commits may overwrite the space of dead chunks.
    #[must_use]
    pub fn reuse_space(&self) -> bool {
        self.reuse_space
    }

    /// Disabling space reuse makes commits append-only, which allows a
    /// concurrent file copy (online backup) to see a consistent prefix.
    pub fn set_reuse_space(&mut self, reuse_space: bool) {
        self.reuse_space = reuse_space;
    }

    /// In-memory page size above which pages split.
    #[must_use]
    pub fn page_split_size(&self) -> usize {
        self.inner.page_split_size
    }

    /// Sets the split threshold. Pages with a single entry can still exceed
    /// it.
    pub fn set_page_split_size(&mut self, bytes: usize) {
        self.inner.page_split_size = bytes;
    }

    /// The user-visible schema version stored in the meta tree (initially 0).
    pub fn store_version(&self) -> Result<u32, StoreError> {
        self.check_open()?;
        Ok(self
            .meta_get("setting.storeVersion")?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    /// Updates the schema version; persisted by the next commit.
    pub fn set_store_version(&mut self, version: u32) -> Result<(), StoreError> {
        self.check_writable()?;
        self.meta_put("setting.storeVersion", version.to_string())
    }

    /// Whether the store was opened (or fell back to) read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Path of the backing file.
    #[must_use]
    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    /// Current size of the backing file in bytes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.inner.file.size()
    }

    /// Positioned reads issued since open.
    #[must_use]
    pub fn file_read_count(&self) -> u64 {
        self.inner.file.read_count()
    }

    /// Positioned writes issued since open.
    #[must_use]
    pub fn file_write_count(&self) -> u64 {
        self.inner.file.write_count()
    }

    /// Estimated number of unsaved in-memory pages. Approximate, especially
    /// after rollbacks.
    #[must_use]
    pub fn unsaved_page_count(&self) -> u64 {
        self.inner.unsaved_pages
    }

    /// Number of live chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.inner.chunks.len()
    }

    /// Id of the newest chunk; strictly increasing across commits.
    #[must_use]
    pub fn last_chunk_id(&self) -> u32 {
        self.last_chunk_id
    }

    /// A copy of the current file header map. Informational only.
    #[must_use]
    pub fn file_header(&self) -> BTreeMap<String, String> {
        self.header.clone()
    }

    /// Reads an entry of the meta tree (`chunk.<id>`, `root.<mapId>`,
    /// `map.<id>`, `name.<name>`, `setting.…`). Informational only; the
    /// meta tree must not be modified directly.
    pub fn meta_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_open()?;
        self.meta_get(key)
    }

    // ---- internal helpers ------------------------------------------------

    pub(crate) fn tree(&self, tree: TreeId) -> Result<&Tree, StoreError> {
        self.trees.get(&tree.0).ok_or_else(unknown_tree)
    }

    pub(crate) fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_writable(&self) -> Result<(), StoreError> {
        self.check_open()?;
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub(crate) fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .meta
            .get(&self.inner, key.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub(crate) fn meta_put(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.meta.put(&mut self.inner, key.as_bytes(), value.as_bytes())?;
        self.changed.insert(META_ID);
        Ok(())
    }

    pub(crate) fn meta_remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.meta.remove(&mut self.inner, key.as_bytes())?;
        self.changed.insert(META_ID);
        Ok(())
    }

    pub(crate) fn mark_meta_changed(&mut self) {
        self.changed.insert(META_ID);
    }

    pub(crate) fn io_error(&self, offset: u64, source: std::io::Error) -> StoreError {
        StoreError::Io {
            file: self.file_name.display().to_string(),
            offset,
            source,
        }
    }
}

/// Best-effort close on drop. Errors are ignored; committed data is already
/// durable and uncommitted changes are discarded by design.
impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close_inner(true);
    }
}

fn unknown_tree() -> StoreError {
    StoreError::InvalidArgument("unknown or closed tree".to_string())
}

fn check_entry_sizes(key: &[u8], value: Option<&[u8]>) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(StoreError::InvalidArgument(format!(
            "key too large: {} bytes (max {MAX_KEY_SIZE})",
            key.len()
        )));
    }
    if let Some(value) = value {
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "value too large: {} bytes (max {MAX_VALUE_SIZE})",
                value.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
