//! Reverting to an earlier version.

use crate::error::StoreError;
use crate::{Store, META_ID};

impl Store {
    /// Reverts to the beginning of `version`: all later changes, committed
    /// or not, are forgotten, and trees created at or after `version` are
    /// closed. A rollback below the newest committed version is persisted
    /// immediately.
    pub fn rollback_to(&mut self, version: u64) -> Result<(), StoreError> {
        self.check_writable()?;
        if !self.is_known_version(version)? {
            return Err(StoreError::InvalidArgument(format!(
                "unknown version {version}"
            )));
        }

        // In-memory rollback of every changed tree, the ledger, and meta.
        let changed: Vec<u32> = self.changed.iter().copied().collect();
        for id in changed {
            if id == META_ID {
                continue;
            }
            if let Some(tree) = self.trees.get_mut(&id) {
                tree.rollback_to(version);
            }
        }
        self.inner.freed.retain(|v, _| *v < version);
        self.meta.rollback_to(version);

        // If committed chunks are newer than the target, drop them and make
        // the chunk that committed `version` the root chunk again.
        let newest_version = self
            .inner
            .chunks
            .get(&self.last_chunk_id)
            .map(|c| c.version);
        let mut load_from_file = false;
        if newest_version.is_some_and(|v| v >= version) {
            self.revert_temp();
            load_from_file = true;
            let mut ids: Vec<u32> = self.inner.chunks.keys().copied().collect();
            ids.sort_unstable();
            let mut keeper = None;
            for id in ids.into_iter().rev() {
                let chunk_version = self.inner.chunks[&id].version;
                if chunk_version > version {
                    self.inner.chunks.remove(&id);
                } else {
                    keeper = Some(self.inner.chunks[&id].clone());
                    break;
                }
            }
            let keeper = keeper.ok_or_else(|| {
                StoreError::Corrupt(format!("no chunk at or below version {version}"))
            })?;
            self.last_chunk_id = keeper.id;
            self.root_chunk_start = keeper.start;
            self.inner.current_version = version;
            // Chunk ids and offsets may be reallocated from here on; cached
            // pages keyed by reused positions must not survive.
            self.inner.clear_cache();
            // Headers first, truncation second: a crash in between leaves
            // the old end header authoritative and the rollback simply not
            // yet happened. Truncating removes every trailing header block
            // newer than the target, so recovery can never resolve a
            // version this rollback discarded.
            self.write_file_header()?;
            let used = self.file_length_used();
            if used < self.inner.file.size() {
                self.inner
                    .file
                    .truncate(used)
                    .map_err(|e| self.io_error(used, e))?;
            }
            self.read_file_header()?;
            self.read_meta()?;
        }

        // Close trees created after the target; reload the survivors from
        // the on-disk state when the rollback crossed a commit.
        let ids: Vec<u32> = self.trees.keys().copied().collect();
        for id in ids {
            if self.trees[&id].create_version() >= version {
                self.trees.remove(&id);
                self.changed.remove(&id);
            } else if load_from_file {
                let root_pos = self
                    .meta_get(&format!("root.{id}"))?
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                if let Some(tree) = self.trees.get_mut(&id) {
                    tree.set_root_pos(&self.inner, root_pos)?;
                }
            }
        }
        self.inner.current_version = version;
        Ok(())
    }
}
