//! Tree lifecycle: open, create, rename, remove.
//!
//! The meta tree is the registry: `name.<name>` maps a name to an id,
//! `map.<id>` holds the tree's metadata, `root.<id>` its persisted root
//! position. Ids are reserved atomically from `last_map_id`, which is
//! persisted in the file header.

use std::collections::BTreeMap;
use std::sync::Arc;

use btree::{KeyComparator, LexicographicOrder, Tree};
use format::map::{format_map, parse_map};

use crate::error::StoreError;
use crate::{Store, TreeId, META_ID};

impl Store {
    /// Opens the tree named `name` with lexicographic key order, creating it
    /// if it does not exist. Opening the same name twice returns the same
    /// handle.
    pub fn open_tree(&mut self, name: &str) -> Result<TreeId, StoreError> {
        self.open_tree_with(name, Arc::new(LexicographicOrder))
    }

    /// Opens (or creates) the tree named `name` with a caller-supplied key
    /// order. The comparator is not persisted; reopening the store must
    /// supply it again.
    pub fn open_tree_with(
        &mut self,
        name: &str,
        cmp: Arc<dyn KeyComparator>,
    ) -> Result<TreeId, StoreError> {
        self.check_open()?;
        if let Some(id_text) = self.meta_get(&format!("name.{name}"))? {
            let id: u32 = id_text
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("bad id for tree {name:?}")))?;
            if self.trees.contains_key(&id) {
                return Ok(TreeId(id));
            }
            let meta_entry = self
                .meta_get(&format!("map.{id}"))?
                .ok_or_else(|| StoreError::Corrupt(format!("missing metadata for tree {id}")))?;
            let tree_config = parse_map(&meta_entry)?;
            let create_version = tree_config
                .get("createVersion")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let root_pos = self
                .meta_get(&format!("root.{id}"))?
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let mut tree = Tree::new(id, create_version, cmp);
            tree.set_root_pos(&self.inner, root_pos)?;
            self.trees.insert(id, tree);
            Ok(TreeId(id))
        } else {
            if self.read_only {
                return Err(StoreError::ReadOnly);
            }
            self.last_map_id += 1;
            let id = self.last_map_id;
            let mut tree_config = BTreeMap::new();
            tree_config.insert("name".to_string(), name.to_string());
            tree_config.insert(
                "createVersion".to_string(),
                self.inner.current_version.to_string(),
            );
            self.meta_put(&format!("map.{id}"), format_map(&tree_config))?;
            self.meta_put(&format!("name.{name}"), id.to_string())?;
            self.trees
                .insert(id, Tree::new(id, self.inner.current_version, cmp));
            Ok(TreeId(id))
        }
    }

    /// Removes a tree: its registry entries disappear with the next commit.
    ///
    /// The tree's pages are not walked; chunks holding only its data are
    /// reclaimed when their other pages die.
    pub fn remove_tree(&mut self, tree: TreeId) -> Result<(), StoreError> {
        self.check_writable()?;
        if tree.0 == META_ID {
            return Err(StoreError::InvalidArgument(
                "the meta tree cannot be removed".to_string(),
            ));
        }
        let id = tree.0;
        let name = self.tree_name(tree)?;
        self.meta_remove(&format!("map.{id}"))?;
        self.meta_remove(&format!("name.{name}"))?;
        self.meta_remove(&format!("root.{id}"))?;
        self.changed.remove(&id);
        self.trees.remove(&id);
        Ok(())
    }

    /// Renames a tree. The new name must be free.
    pub fn rename_tree(&mut self, tree: TreeId, new_name: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        if tree.0 == META_ID {
            return Err(StoreError::InvalidArgument(
                "the meta tree cannot be renamed".to_string(),
            ));
        }
        let id = tree.0;
        let old_name = self.tree_name(tree)?;
        if old_name == new_name {
            return Ok(());
        }
        if self.meta_get(&format!("name.{new_name}"))?.is_some() {
            return Err(StoreError::InvalidArgument(format!(
                "a tree named {new_name:?} already exists"
            )));
        }
        let create_version = self.tree(tree)?.create_version();
        self.meta_remove(&format!("name.{old_name}"))?;
        let mut tree_config = BTreeMap::new();
        tree_config.insert("name".to_string(), new_name.to_string());
        tree_config.insert("createVersion".to_string(), create_version.to_string());
        self.meta_put(&format!("map.{id}"), format_map(&tree_config))?;
        self.meta_put(&format!("name.{new_name}"), id.to_string())?;
        Ok(())
    }

    /// The current name of a tree.
    pub fn tree_name(&self, tree: TreeId) -> Result<String, StoreError> {
        self.check_open()?;
        self.tree(tree)?;
        let meta_entry = self
            .meta_get(&format!("map.{}", tree.0))?
            .ok_or_else(|| StoreError::Corrupt(format!("missing metadata for tree {}", tree.0)))?;
        parse_map(&meta_entry)?
            .get("name")
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("unnamed tree {}", tree.0)))
    }
}
