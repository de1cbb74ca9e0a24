//! Ordered iteration over one tree root.

use std::sync::Arc;

use crate::page::Page;
use crate::tree::Tree;
use crate::{KeyComparator, PageStore, TreeError};

/// An in-order cursor over the entries reachable from one root page.
///
/// The cursor holds `Arc`s to the pages on its descent path, so it stays
/// valid while the owning tree moves on to newer roots. Pages are loaded
/// through the store on demand; a load failure is yielded once and then the
/// cursor is exhausted.
pub struct Cursor<'a> {
    store: &'a dyn PageStore,
    /// Descent path: on leaves the index is the next entry to yield, on
    /// internal pages the next child to descend into.
    stack: Vec<(Arc<Page>, usize)>,
    failed: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        store: &'a dyn PageStore,
        root: Arc<Page>,
        from: Option<(&dyn KeyComparator, &[u8])>,
    ) -> Result<Self, TreeError> {
        let mut cursor = Self {
            store,
            stack: Vec::new(),
            failed: false,
        };
        match from {
            None => cursor.stack.push((root, 0)),
            Some((cmp, key)) => cursor.seek(root, cmp, key)?,
        }
        Ok(cursor)
    }

    /// Positions the stack at the first entry with a key at or after `key`.
    fn seek(
        &mut self,
        root: Arc<Page>,
        cmp: &dyn KeyComparator,
        key: &[u8],
    ) -> Result<(), TreeError> {
        let mut page = root;
        loop {
            let found = page.search(cmp, key);
            if page.is_leaf() {
                let idx = match found {
                    Ok(i) | Err(i) => i,
                };
                self.stack.push((page, idx));
                return Ok(());
            }
            let child_idx = match found {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            let child = Tree::child_page(self.store, &page, child_idx)?;
            self.stack.push((page, child_idx + 1));
            page = child;
        }
    }

    fn step(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        loop {
            let Some((page, index)) = self.stack.last_mut() else {
                return Ok(None);
            };
            if page.is_leaf() {
                if *index < page.key_count() {
                    let entry = (page.key(*index).to_vec(), page.value(*index).to_vec());
                    *index += 1;
                    return Ok(Some(entry));
                }
                self.stack.pop();
            } else if *index < page.child_count() {
                let child_idx = *index;
                *index += 1;
                let parent = Arc::clone(page);
                let child = Tree::child_page(self.store, &parent, child_idx)?;
                self.stack.push((child, 0));
            } else {
                self.stack.pop();
            }
        }
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
