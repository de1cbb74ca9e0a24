//! One versioned ordered map.
//!
//! A `Tree` owns its current root page plus the in-memory history of earlier
//! roots (at most one per version), which is what makes rollback within the
//! uncommitted window possible. All page access goes through a [`PageStore`]
//! borrowed per operation, so the tree itself stays a small value the host
//! store can own in a table.

use std::sync::Arc;

use crate::cursor::Cursor;
use crate::page::{write_unsaved_recursive, ChildRef, Page, WriteStats};
use crate::{KeyComparator, PageStore, TreeError};

/// A single ordered map backed by a copy-on-write B-tree.
pub struct Tree {
    id: u32,
    create_version: u64,
    root: Arc<Page>,
    /// Earlier roots, oldest first, one entry per write version.
    old_roots: Vec<Arc<Page>>,
    cmp: Arc<dyn KeyComparator>,
    read_only: bool,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("create_version", &self.create_version)
            .field("len", &self.root.total_count())
            .field("root_pos", &self.root.pos())
            .field("old_roots", &self.old_roots.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl Tree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new(id: u32, create_version: u64, cmp: Arc<dyn KeyComparator>) -> Self {
        Self {
            id,
            create_version,
            root: Arc::new(Page::empty_leaf(id)),
            old_roots: Vec::new(),
            cmp,
            read_only: false,
        }
    }

    /// Creates a read-only tree over an existing root (a historical view).
    #[must_use]
    pub fn snapshot(
        id: u32,
        create_version: u64,
        root: Arc<Page>,
        cmp: Arc<dyn KeyComparator>,
    ) -> Self {
        Self {
            id,
            create_version,
            root,
            old_roots: Vec::new(),
            cmp,
            read_only: true,
        }
    }

    /// The map id (0 is reserved for the meta tree).
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Version at which this tree was created.
    #[must_use]
    pub fn create_version(&self) -> u64 {
        self.create_version
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.root.total_count()
    }

    /// Whether the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.total_count() == 0
    }

    /// The current root page.
    #[must_use]
    pub fn root(&self) -> &Arc<Page> {
        &self.root
    }

    /// The tree's comparator, shared with snapshots.
    #[must_use]
    pub fn comparator(&self) -> Arc<dyn KeyComparator> {
        Arc::clone(&self.cmp)
    }

    /// Whether this tree carries changes the store has not committed.
    ///
    /// A persisted root means nothing changed since the last commit; an
    /// unsaved root counts once it holds data or supersedes earlier roots
    /// (so "created empty and never touched" is not a change).
    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        self.root.pos() == 0 && (self.root.total_count() > 0 || !self.old_roots.is_empty())
    }

    /// Installs the root read from `pos` (0 for an empty tree), discarding
    /// any in-memory history.
    pub fn set_root_pos(&mut self, store: &dyn PageStore, pos: u64) -> Result<(), TreeError> {
        self.root = if pos == 0 {
            Arc::new(Page::empty_leaf(self.id))
        } else {
            store.read_page(self.id, pos)?
        };
        self.old_roots.clear();
        Ok(())
    }

    /// Looks up `key`.
    pub fn get(&self, store: &dyn PageStore, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        let mut page = Arc::clone(&self.root);
        loop {
            let found = page.search(self.cmp.as_ref(), key);
            if page.is_leaf() {
                return Ok(found.ok().map(|i| page.value(i).to_vec()));
            }
            let idx = match found {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            page = Self::child_page(store, &page, idx)?;
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, store: &dyn PageStore, key: &[u8]) -> Result<bool, TreeError> {
        Ok(self.get(store, key)?.is_some())
    }

    /// Returns the leaf page currently holding `key`, if the key exists.
    ///
    /// Compaction uses this to decide whether a key's bytes still live in a
    /// chunk that is about to be collected.
    pub fn get_page(
        &self,
        store: &dyn PageStore,
        key: &[u8],
    ) -> Result<Option<Arc<Page>>, TreeError> {
        let mut page = Arc::clone(&self.root);
        loop {
            let found = page.search(self.cmp.as_ref(), key);
            if page.is_leaf() {
                return Ok(found.ok().map(|_| page));
            }
            let idx = match found {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            page = Self::child_page(store, &page, idx)?;
        }
    }

    /// Ordered iteration over all entries.
    pub fn iter<'a>(&self, store: &'a dyn PageStore) -> Result<Cursor<'a>, TreeError> {
        Cursor::new(store, Arc::clone(&self.root), None)
    }

    /// Ordered iteration over entries with keys at or after `from`.
    pub fn iter_from<'a>(
        &self,
        store: &'a dyn PageStore,
        from: &[u8],
    ) -> Result<Cursor<'a>, TreeError> {
        Cursor::new(
            store,
            Arc::clone(&self.root),
            Some((self.cmp.as_ref(), from)),
        )
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn put(
        &mut self,
        store: &mut dyn PageStore,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>, TreeError> {
        self.ensure_writable()?;
        let write_version = store.write_version() as i64;
        let mut p = copy_for_write(Arc::clone(&self.root), write_version, store);
        if p.memory() > store.page_split_size() && p.key_count() > 1 {
            p = split_root(p, write_version, store);
        }
        let result = put_rec(self.cmp.as_ref(), store, &mut p, write_version, key, value)?;
        self.install_root(Arc::new(p));
        Ok(result)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(
        &mut self,
        store: &mut dyn PageStore,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, TreeError> {
        self.ensure_writable()?;
        if self.get(store, key)?.is_none() {
            return Ok(None);
        }
        let write_version = store.write_version() as i64;
        let mut p = copy_for_write(Arc::clone(&self.root), write_version, store);
        let result = remove_rec(self.cmp.as_ref(), store, &mut p, write_version, key)?;
        // Collapse trivial roots left behind by the removal: a node that
        // lost its last separator routes everything through one child.
        loop {
            if p.is_leaf() || p.key_count() > 0 {
                break;
            }
            if p.child_count() == 0 {
                store.remove_page(0);
                p = Page::empty_leaf_versioned(p.map_id(), write_version);
                store.register_unsaved_page();
                break;
            }
            let child = match p.take_child_page(0) {
                Some(live) => live,
                None => store.read_page(self.id, p.child_pos(0))?,
            };
            store.remove_page(0);
            p = copy_for_write(child, write_version, store);
        }
        self.install_root(Arc::new(p));
        Ok(result)
    }

    /// Reverts the tree to the newest in-memory root strictly older than
    /// `version` (the state at the beginning of that version). Roots created
    /// at or after `version` are discarded.
    pub fn rollback_to(&mut self, version: u64) {
        if version <= self.create_version {
            // The store closes trees created at or after the target version.
            return;
        }
        let v = version as i64;
        if self.root.version() >= v {
            while let Some(last) = self.old_roots.pop() {
                self.root = last;
                if self.root.version() < v {
                    break;
                }
            }
        }
    }

    /// Newest root (current or historical) strictly older than
    /// `before_version`.
    #[must_use]
    pub fn root_at(&self, before_version: i64) -> Option<Arc<Page>> {
        if self.root.version() < before_version {
            return Some(Arc::clone(&self.root));
        }
        self.old_roots
            .iter()
            .rev()
            .find(|r| r.version() < before_version)
            .cloned()
    }

    /// Drops the in-memory root history (after a commit has persisted the
    /// current root).
    pub fn clear_old_roots(&mut self) {
        self.old_roots.clear();
    }

    /// Serializes every unsaved page of this tree into `buf` and installs
    /// the persisted root. Returns the root position (0 for an empty tree).
    pub fn write_unsaved(
        &mut self,
        chunk_id: u32,
        buf: &mut Vec<u8>,
        stats: &mut WriteStats,
        store: &mut dyn PageStore,
    ) -> u64 {
        if self.root.total_count() == 0 {
            return 0;
        }
        let written = write_unsaved_recursive(&self.root, chunk_id, buf, stats, store);
        let pos = written.pos();
        self.root = written;
        pos
    }

    fn ensure_writable(&self) -> Result<(), TreeError> {
        if self.read_only {
            Err(TreeError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn install_root(&mut self, new_root: Arc<Page>) {
        if Arc::ptr_eq(&self.root, &new_root) {
            return;
        }
        if new_root.version() != self.root.version() {
            let keep = match self.old_roots.last() {
                Some(last) => last.version() != self.root.version(),
                None => true,
            };
            if keep {
                self.old_roots.push(Arc::clone(&self.root));
            }
        }
        self.root = new_root;
    }

    pub(crate) fn child_page(
        store: &dyn PageStore,
        page: &Arc<Page>,
        index: usize,
    ) -> Result<Arc<Page>, TreeError> {
        if let Some(live) = page.child_page(index) {
            return Ok(live);
        }
        let pos = page.child_pos(index);
        if pos == 0 {
            return Err(TreeError::CorruptPage {
                pos: page.pos(),
                reason: "child slot has neither page nor position",
            });
        }
        store.read_page(page.map_id(), pos)
    }
}

/// Clones `page` for mutation under `write_version`.
///
/// A page created at the same write version that nobody else references is
/// reused as-is. Anything else is copied; the original is reported to the
/// freed-page ledger (or the unsaved counter, for in-memory pages).
fn copy_for_write(page: Arc<Page>, write_version: i64, store: &mut dyn PageStore) -> Page {
    if page.version() == write_version && page.pos() == 0 {
        return match Arc::try_unwrap(page) {
            Ok(owned) => owned,
            Err(shared) => (*shared).clone(),
        };
    }
    let old_pos = page.pos();
    let mut copy = (*page).clone();
    drop(page);
    copy.clear_pos();
    copy.set_version(write_version);
    store.remove_page(old_pos);
    store.register_unsaved_page();
    copy
}

/// Loads and copies the child at `index` for mutation.
fn child_for_write(
    page: &mut Page,
    index: usize,
    write_version: i64,
    store: &mut dyn PageStore,
) -> Result<Page, TreeError> {
    let child = match page.take_child_page(index) {
        Some(live) => live,
        None => store.read_page(page.map_id(), page.child_pos(index))?,
    };
    Ok(copy_for_write(child, write_version, store))
}

/// Replaces an oversized root with a node over its two halves.
fn split_root(mut left: Page, write_version: i64, store: &mut dyn PageStore) -> Page {
    let at = left.key_count() / 2;
    let separator = left.key(at).to_vec();
    let right = left.split(at);
    store.register_unsaved_page();
    let map_id = left.map_id();
    let node = Page::new_node(
        map_id,
        write_version,
        vec![separator],
        vec![ChildRef::of(Arc::new(left)), ChildRef::of(Arc::new(right))],
    );
    store.register_unsaved_page();
    node
}

fn put_rec(
    cmp: &dyn KeyComparator,
    store: &mut dyn PageStore,
    p: &mut Page,
    write_version: i64,
    key: &[u8],
    value: &[u8],
) -> Result<Option<Vec<u8>>, TreeError> {
    if p.is_leaf() {
        return Ok(match p.search(cmp, key) {
            Ok(i) => Some(p.set_value(i, value.to_vec())),
            Err(i) => {
                p.insert_leaf(i, key.to_vec(), value.to_vec());
                None
            }
        });
    }
    let idx = match p.search(cmp, key) {
        Ok(i) => i + 1,
        Err(i) => i,
    };
    let mut child = child_for_write(p, idx, write_version, store)?;
    if child.memory() > store.page_split_size() && child.key_count() > 1 {
        // Split on the way down; the slot keeps the right half, the left
        // half slides in before it, then the search restarts on this page.
        let at = child.key_count() / 2;
        let separator = child.key(at).to_vec();
        let right = child.split(at);
        store.register_unsaved_page();
        p.set_child(idx, Arc::new(right));
        p.insert_child(idx, separator, Arc::new(child));
        return put_rec(cmp, store, p, write_version, key, value);
    }
    let result = put_rec(cmp, store, &mut child, write_version, key, value)?;
    p.set_child(idx, Arc::new(child));
    Ok(result)
}

fn remove_rec(
    cmp: &dyn KeyComparator,
    store: &mut dyn PageStore,
    p: &mut Page,
    write_version: i64,
    key: &[u8],
) -> Result<Option<Vec<u8>>, TreeError> {
    if p.is_leaf() {
        return Ok(match p.search(cmp, key) {
            Ok(i) => Some(p.remove_leaf(i)),
            Err(_) => None,
        });
    }
    let idx = match p.search(cmp, key) {
        Ok(i) => i + 1,
        Err(i) => i,
    };
    let mut child = child_for_write(p, idx, write_version, store)?;
    let result = remove_rec(cmp, store, &mut child, write_version, key)?;
    if result.is_none() {
        p.set_child(idx, Arc::new(child));
        return Ok(None);
    }
    if child.total_count() == 0 {
        p.remove_child(idx);
        store.remove_page(0);
    } else {
        p.set_child(idx, Arc::new(child));
    }
    Ok(result)
}
