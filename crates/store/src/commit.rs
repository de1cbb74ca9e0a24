//! The commit pipeline, the block allocator, and space accounting.
//!
//! A commit serializes every changed tree plus the meta tree into one chunk
//! and writes it with a single positioned write. From a reader's point of
//! view the commit is atomic: the newest valid header decides which chunk
//! is the root, and headers only become valid after their chunk's bytes are
//! in place within the write.

use btree::WriteStats;

use crate::chunk::{Chunk, CHUNK_HEADER_SIZE};
use crate::error::StoreError;
use crate::recovery::unix_seconds;
use crate::{Store, BLOCK_SIZE, META_ID};

impl Store {
    /// Commits all unsaved changes, producing a new chunk and advancing the
    /// current version.
    ///
    /// Returns the current version, incremented only if there was anything
    /// to write; a commit with no unsaved changes performs no I/O.
    ///
    /// # Pipeline
    ///
    /// 1. Refresh the previous chunk's meta entry (its live accounting kept
    ///    moving while it was newest) and create the new chunk's placeholder
    ///    entry, so the meta tree's footprint is stable before positions
    ///    are known.
    /// 2. Apply the freed-page ledger; drop chunks that are both empty and
    ///    past the retention window, repeating while the drops themselves
    ///    free pages. Every surviving chunk's entry is rewritten, keeping
    ///    all `chunk.*` leaves inside the newest chunk for recovery.
    /// 3. Serialize changed trees (children before parents), then the real
    ///    root positions, then the meta tree itself.
    /// 4. Pad to a block boundary, append one trailing header block, pick
    ///    the destination (first-fit among free blocks, or end of file),
    ///    and write the whole image at once.
    /// 5. Rewrite the two leading headers only when the chunk did not land
    ///    at the end of the file; otherwise the trailing block is the
    ///    newest header and the leading pair may lag.
    pub fn commit(&mut self) -> Result<u64, StoreError> {
        self.check_writable()?;
        if !self.has_unsaved_changes() {
            return Ok(self.inner.current_version);
        }

        let unsaved_at_start = self.inner.unsaved_pages;
        self.inner.current_version += 1;
        let version = self.inner.current_version;
        let mut time = self.seconds_since_creation();

        // The newest chunk's accounting was still moving after it was
        // written; persist its final state now.
        if let Some(last) = self.inner.chunks.get(&self.last_chunk_id).cloned() {
            time = time.max(last.time);
            self.meta_put(&format!("chunk.{}", last.id), last.to_meta_string())?;
        }

        self.last_chunk_id += 1;
        if self.last_chunk_id > format::pos::MAX_CHUNK_ID {
            return Err(StoreError::Corrupt("chunk id space exhausted".to_string()));
        }
        let mut chunk = Chunk::new(self.last_chunk_id, version, time);
        self.inner.chunks.insert(chunk.id, chunk.clone());
        self.meta_put(&format!("chunk.{}", chunk.id), chunk.to_meta_string())?;

        // Provisional root entries so the meta footprint no longer changes
        // once real positions get patched in.
        let mut changed_ids: Vec<u32> = self
            .changed
            .iter()
            .copied()
            .filter(|id| *id != META_ID)
            .collect();
        changed_ids.sort_unstable();
        let mut live_ids = Vec::new();
        for id in changed_ids {
            let Some(tree) = self.trees.get(&id) else {
                continue;
            };
            if !tree.has_unsaved_changes() {
                continue;
            }
            let placeholder = if tree.is_empty() {
                "0".to_string()
            } else {
                u64::MAX.to_string()
            };
            self.meta_put(&format!("root.{id}"), placeholder)?;
            live_ids.push(id);
        }

        self.apply_freed_chunks()?;
        let mut removed: Vec<u32> = Vec::new();
        loop {
            let mut ids: Vec<u32> = self.inner.chunks.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                if removed.contains(&id) {
                    continue;
                }
                let Some(c) = self.inner.chunks.get(&id).cloned() else {
                    continue;
                };
                if c.max_length_live == 0 && self.can_overwrite_chunk(&c, time) {
                    self.meta_remove(&format!("chunk.{id}"))?;
                    removed.push(id);
                } else {
                    self.meta_put(&format!("chunk.{id}"), c.to_meta_string())?;
                }
                self.apply_freed_chunks()?;
            }
            if self.inner.freed.is_empty() {
                break;
            }
        }

        // Serialize changed trees; positions are assigned in append order,
        // so parents always reference already-written children.
        let mut buf = std::mem::take(&mut self.write_buffer);
        buf.clear();
        buf.resize(CHUNK_HEADER_SIZE, 0);
        let mut stats = WriteStats::default();
        for id in &live_ids {
            let Some(tree) = self.trees.get_mut(id) else {
                continue;
            };
            let root_pos = tree.write_unsaved(chunk.id, &mut buf, &mut stats, &mut self.inner);
            if root_pos != 0 {
                self.meta_put(&format!("root.{id}"), root_pos.to_string())?;
            }
        }
        chunk.page_count = stats.page_count;
        chunk.max_length = stats.max_length;
        chunk.max_length_live = stats.max_length_live;
        // The meta entry written here misses the meta tree's own pages; the
        // binary header below carries the complete numbers, and the entry
        // is corrected at the start of the next commit.
        self.meta_put(&format!("chunk.{}", chunk.id), chunk.to_meta_string())?;
        debug_assert!(
            self.inner.freed.is_empty(),
            "meta updates during serialization must only touch unsaved pages"
        );
        let meta_root_pos = self
            .meta
            .write_unsaved(chunk.id, &mut buf, &mut stats, &mut self.inner);
        chunk.page_count = stats.page_count;
        chunk.max_length = stats.max_length;
        chunk.max_length_live = stats.max_length_live;
        chunk.meta_root_pos = meta_root_pos;

        let content_len = buf.len() as u64;
        let padded = content_len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let total_len = padded + BLOCK_SIZE;
        let file_pos = if self.reuse_space {
            self.allocate_chunk(total_len)
        } else {
            self.file_length_used()
        };
        // Measured against the real file size, not the used length: a chunk
        // that lands before stale trailing blocks must refresh the leading
        // headers, or recovery would resolve an older version.
        let at_end = file_pos + total_len >= self.inner.file.size();

        chunk.start = file_pos;
        chunk.length = content_len as u32;
        chunk.write_header(&mut buf[..CHUNK_HEADER_SIZE]);
        self.root_chunk_start = file_pos;
        self.inner.chunks.insert(chunk.id, chunk);
        self.revert_temp();

        buf.resize(total_len as usize, 0);
        let header_bytes = self.file_header_bytes()?;
        buf[padded as usize..padded as usize + header_bytes.len()].copy_from_slice(&header_bytes);

        self.inner
            .file
            .write_at(file_pos, &buf)
            .map_err(|e| self.io_error(file_pos, e))?;
        if buf.capacity() <= 4 * 1024 * 1024 {
            buf.clear();
            self.write_buffer = buf;
        }

        if !at_end {
            self.write_file_header()?;
            self.shrink_file_if_possible(1)?;
        }
        for id in removed {
            self.inner.chunks.remove(&id);
        }
        self.inner.unsaved_pages = self.inner.unsaved_pages.saturating_sub(unsaved_at_start);
        Ok(version)
    }

    /// Merges the pending per-version live-byte decrements into the chunk
    /// table. Old pages are only accounted dead at commit; while a version
    /// is alive in memory its pages may still serve historical reads.
    pub(crate) fn apply_freed_chunks(&mut self) -> Result<(), StoreError> {
        let freed = std::mem::take(&mut self.inner.freed);
        for (_version, by_chunk) in freed {
            for (chunk_id, bytes) in by_chunk {
                let chunk = self.inner.chunks.get_mut(&chunk_id).ok_or_else(|| {
                    StoreError::Corrupt(format!("freed pages in unknown chunk {chunk_id}"))
                })?;
                chunk.max_length_live -= bytes;
                if chunk.max_length_live < 0 {
                    return Err(StoreError::Corrupt(format!(
                        "negative live length {} in chunk {chunk_id}",
                        chunk.max_length_live
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether `chunk`'s bytes may be overwritten at time `time`.
    pub(crate) fn can_overwrite_chunk(&self, chunk: &Chunk, time: u64) -> bool {
        chunk.time + self.retention_time <= time
    }

    /// Seconds since store creation, clamped at zero against clock skew.
    pub(crate) fn seconds_since_creation(&self) -> u64 {
        unix_seconds().saturating_sub(self.creation_time)
    }

    /// Forgets per-commit temporary state: the freed ledger and the
    /// in-memory root history of every changed tree.
    pub(crate) fn revert_temp(&mut self) {
        self.inner.freed.clear();
        let ids: Vec<u32> = self.changed.drain().collect();
        for id in ids {
            if let Some(tree) = self.trees.get_mut(&id) {
                tree.clear_old_roots();
            }
        }
        self.meta.clear_old_roots();
    }

    /// First-fit allocation of `length` bytes among the blocks not covered
    /// by live chunks. Blocks 0 and 1 are never available, and every chunk
    /// keeps a one-block gap after it so its trailing header block stays
    /// discoverable. Falls back to the end of the occupied region.
    pub(crate) fn allocate_chunk(&self, length: u64) -> u64 {
        let mut used = vec![true, true];
        let mark = |used: &mut Vec<bool>, block: usize| {
            if block >= used.len() {
                used.resize(block + 1, false);
            }
            used[block] = true;
        };
        for c in self.inner.chunks.values() {
            if c.start == u64::MAX {
                continue;
            }
            let first = (c.start / BLOCK_SIZE) as usize;
            let last = ((c.start + u64::from(c.length)) / BLOCK_SIZE) as usize;
            for block in first..=last + 1 {
                mark(&mut used, block);
            }
        }
        let required = length.div_ceil(BLOCK_SIZE) as usize + 1;
        'scan: for start in 0..used.len() {
            for offset in 0..required {
                let block = start + offset;
                if block < used.len() && used[block] {
                    continue 'scan;
                }
            }
            return start as u64 * BLOCK_SIZE;
        }
        used.len() as u64 * BLOCK_SIZE
    }

    /// End of the last byte any live chunk (or the header pair) occupies,
    /// rounded up to blocks and including the trailing header block.
    pub(crate) fn file_length_used(&self) -> u64 {
        let mut size = 2 * BLOCK_SIZE;
        for c in self.inner.chunks.values() {
            if c.start == u64::MAX {
                continue;
            }
            let end = c.start + u64::from(c.length);
            size = size.max(end.div_ceil(BLOCK_SIZE) * BLOCK_SIZE + BLOCK_SIZE);
        }
        size
    }

    /// Truncates trailing dead space when at least `min_percent` percent of
    /// the file would be saved (and at least one block).
    pub(crate) fn shrink_file_if_possible(&mut self, min_percent: u64) -> Result<(), StoreError> {
        let used = self.file_length_used();
        let size = self.inner.file.size();
        if used >= size {
            return Ok(());
        }
        if min_percent > 0 && size - used < BLOCK_SIZE {
            return Ok(());
        }
        let saved_percent = 100 - used * 100 / size;
        if saved_percent < min_percent {
            return Ok(());
        }
        self.inner
            .file
            .truncate(used)
            .map_err(|e| self.io_error(used, e))
    }
}
