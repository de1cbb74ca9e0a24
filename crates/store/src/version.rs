//! Version bookkeeping and historical reads.
//!
//! A version `v` is *known* while every chunk its meta tree references
//! still exists; only known versions can be read or rolled back to.
//! Historical reads materialize the committed state of `v`: the chunk with
//! that version locates an old meta root, which locates the tree's old
//! root. Pages are shared with current readers through the cache.

use std::sync::Arc;

use btree::{Cursor, Page, PageStore, Tree};

use crate::chunk::Chunk;
use crate::error::StoreError;
use crate::{Store, TreeId, META_ID};

/// A read-only view of one tree as of a committed version.
///
/// The snapshot stays valid while its version is known; once the chunks it
/// references are dropped (all their pages died and the retention window
/// passed), reads fail with a chunk-not-found error.
pub struct TreeSnapshot {
    pub(crate) tree: Tree,
    pub(crate) version: u64,
}

impl std::fmt::Debug for TreeSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeSnapshot")
            .field("version", &self.version)
            .field("len", &self.tree.len())
            .finish()
    }
}

impl TreeSnapshot {
    /// The version this snapshot materializes.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of entries as of the snapshot's version.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    /// Whether the snapshot holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.len() == 0
    }

    /// Looks up `key` as of the snapshot's version.
    pub fn get(&self, store: &Store, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        store.check_open()?;
        Ok(self.tree.get(&store.inner, key)?)
    }

    /// Whether `key` existed at the snapshot's version.
    pub fn contains_key(&self, store: &Store, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(store, key)?.is_some())
    }

    /// Ordered iteration over the snapshot.
    pub fn iter<'a>(&self, store: &'a Store) -> Result<Cursor<'a>, StoreError> {
        store.check_open()?;
        Ok(self.tree.iter(&store.inner)?)
    }
}

impl Store {
    /// Opens a read-only view of `tree` as of committed version `version`.
    pub fn open_tree_version(
        &self,
        tree: TreeId,
        version: u64,
    ) -> Result<TreeSnapshot, StoreError> {
        self.check_open()?;
        let t = self.tree(tree)?;
        if version < t.create_version() || !self.is_known_version(version)? {
            return Err(StoreError::InvalidArgument(format!(
                "unknown version {version}"
            )));
        }
        let root = if version == self.inner.current_version {
            // The committed state of the current version is the newest root
            // strictly older than the pending write version.
            match t.root_at(version as i64) {
                Some(root) => root,
                None => self.committed_root(t.id(), version)?,
            }
        } else {
            self.committed_root(t.id(), version)?
        };
        Ok(TreeSnapshot {
            tree: Tree::snapshot(t.id(), t.create_version(), root, t.comparator()),
            version,
        })
    }

    /// Whether all data of `version` is still readable.
    pub fn is_known_version(&self, version: u64) -> Result<bool, StoreError> {
        if version > self.inner.current_version {
            return Ok(false);
        }
        if version == self.inner.current_version || self.inner.chunks.is_empty() {
            return Ok(true);
        }
        let Some(chunk) = self.chunk_for_version(version) else {
            return Ok(false);
        };
        // Every chunk the old meta references must still be present.
        let old_meta = self.meta_tree_at(&chunk)?;
        for item in old_meta.iter_from(&self.inner, b"chunk.")? {
            let (key, _) = item?;
            if !key.starts_with(b"chunk.") {
                break;
            }
            if self.meta.get(&self.inner, &key)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The chunk produced by the commit of `version`, if it still exists.
    pub(crate) fn chunk_for_version(&self, version: u64) -> Option<Chunk> {
        let mut ids: Vec<u32> = self.inner.chunks.keys().copied().collect();
        ids.sort_unstable();
        // Versions increase with chunk ids, so scan newest first.
        for id in ids.into_iter().rev() {
            let chunk = &self.inner.chunks[&id];
            if chunk.version == version {
                return Some(chunk.clone());
            }
            if chunk.version < version {
                return None;
            }
        }
        None
    }

    /// A read-only meta tree rooted in `chunk`.
    pub(crate) fn meta_tree_at(&self, chunk: &Chunk) -> Result<Tree, StoreError> {
        // Re-read the header: the in-memory meta entry for the newest chunk
        // can lag behind the binary header.
        let header = self.read_chunk_header(chunk.start)?;
        let root = self.inner.read_page(META_ID, header.meta_root_pos)?;
        Ok(Tree::snapshot(META_ID, 0, root, self.meta.comparator()))
    }

    /// The persisted root of tree `id` as of `version`.
    pub(crate) fn committed_root(&self, id: u32, version: u64) -> Result<Arc<Page>, StoreError> {
        let Some(chunk) = self.chunk_for_version(version) else {
            return Err(StoreError::InvalidArgument(format!(
                "unknown version {version}"
            )));
        };
        let old_meta = self.meta_tree_at(&chunk)?;
        let root_pos = old_meta
            .get(&self.inner, format!("root.{id}").as_bytes())?
            .and_then(|v| String::from_utf8_lossy(&v).parse::<u64>().ok())
            .unwrap_or(0);
        if root_pos == 0 {
            Ok(Arc::new(Page::empty_leaf(id)))
        } else {
            Ok(self.inner.read_page(id, root_pos)?)
        }
    }
}
