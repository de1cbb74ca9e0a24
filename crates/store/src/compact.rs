//! Compaction: migrating live keys out of cold, under-utilized chunks.

use std::collections::HashSet;

use btree::Page;

use crate::chunk::{Chunk, CHUNK_HEADER_SIZE};
use crate::error::StoreError;
use crate::{Store, META_ID};

impl Store {
    /// Rewrites chunks with a low share of live data so their space can be
    /// reclaimed. Returns whether anything was written.
    ///
    /// No work happens while the aggregate fill rate (live bytes over
    /// nominal bytes, in percent) is above `target_fill_rate`. Otherwise
    /// chunks past the retention window are ordered by
    /// `fill_rate / age` (coldest and emptiest first) and about one
    /// average chunk's worth of live data is rewritten: every key whose
    /// current page still lives in a selected chunk is removed and
    /// re-inserted, forcing a copy-on-write into the next commit's chunk.
    /// The final commit happens inside this call.
    ///
    /// Keys of a selected chunk that meanwhile moved to newer chunks are
    /// left alone, so compaction never touches hot data.
    pub fn compact(&mut self, target_fill_rate: i64) -> Result<bool, StoreError> {
        self.check_writable()?;
        if self.inner.chunks.is_empty() {
            return Ok(false);
        }
        let mut max_sum: i64 = 0;
        let mut live_sum: i64 = 0;
        for c in self.inner.chunks.values() {
            max_sum += c.max_length;
            live_sum += c.max_length_live;
        }
        if max_sum <= 0 {
            max_sum = 1;
        }
        if 100 * live_sum / max_sum > target_fill_rate {
            return Ok(false);
        }
        let average_length = max_sum / self.inner.chunks.len() as i64;
        let time = self.seconds_since_creation();

        let mut old: Vec<Chunk> = self
            .inner
            .chunks
            .values()
            .filter(|c| self.can_overwrite_chunk(c, time))
            .cloned()
            .collect();
        if old.is_empty() {
            return Ok(false);
        }
        for c in &mut old {
            let age = i64::from(self.last_chunk_id - c.id + 1);
            c.collect_priority = c.fill_rate() / age;
        }
        old.sort_by_key(|c| (c.collect_priority, c.id));

        // Target about one average chunk's worth of live data, but always
        // at least one chunk.
        let mut moved: i64 = 0;
        let mut cut = 0;
        for (i, c) in old.iter().enumerate() {
            if i > 0 && moved + c.max_length_live > average_length {
                break;
            }
            moved += c.max_length_live;
            cut = i + 1;
        }
        old.truncate(cut);

        let selected: HashSet<u32> = old.iter().map(|c| c.id).collect();
        for chunk in &old {
            self.copy_live(chunk, &selected)?;
        }
        self.commit()?;
        Ok(true)
    }

    /// Walks every page of `chunk` in buffer order and rewrites each key
    /// whose currently-live page is inside the selected set.
    fn copy_live(&mut self, chunk: &Chunk, selected: &HashSet<u32>) -> Result<(), StoreError> {
        let buf = self
            .inner
            .file
            .read_at(chunk.start, chunk.length as usize)
            .map_err(|e| self.io_error(chunk.start, e))?;
        self.mark_meta_changed();
        let mut offset = CHUNK_HEADER_SIZE;
        while offset < chunk.length as usize {
            let (page_len, map_id) = Page::peek_frame(&buf[offset..], offset as u32)?;
            let end = offset + page_len as usize;
            if end > buf.len() {
                return Err(StoreError::Corrupt(format!(
                    "page at {offset} overruns chunk {}",
                    chunk.id
                )));
            }
            let known_map = map_id == META_ID || self.trees.contains_key(&map_id);
            if !known_map {
                offset = end;
                continue;
            }
            let page = Page::read_in_chunk(&buf[offset..end], chunk.id, offset as u32)?;
            let keys: Vec<Vec<u8>> = page.keys().map(<[u8]>::to_vec).collect();
            for key in keys {
                let live = {
                    let tree = if map_id == META_ID {
                        &self.meta
                    } else {
                        match self.trees.get(&map_id) {
                            Some(t) => t,
                            None => break,
                        }
                    };
                    tree.get_page(&self.inner, &key)?
                };
                // Deleted since, or an unsaved page that moves anyway.
                let Some(live) = live else { continue };
                if live.pos() == 0 {
                    continue;
                }
                if !selected.contains(&format::pos::chunk_id(live.pos())) {
                    continue;
                }
                let tree = if map_id == META_ID {
                    &mut self.meta
                } else {
                    match self.trees.get_mut(&map_id) {
                        Some(t) => t,
                        None => break,
                    }
                };
                if let Some(value) = tree.remove(&mut self.inner, &key)? {
                    tree.put(&mut self.inner, &key, &value)?;
                }
                self.changed.insert(map_id);
            }
            offset = end;
        }
        Ok(())
    }
}
