//! Opening a store: header selection and chunk-table reconstruction.
//!
//! The textual file header is written in three kinds of places: blocks 0
//! and 1 at the start of the file, and the trailing block of every chunk.
//! Each copy checksums itself with Fletcher-32, and each carries the version
//! it was written at. On open, block 0, block 1, and the first
//! checksum-valid block scanning backwards from the end are candidates; the
//! highest version wins. The backward scan stops at the first valid block,
//! and rollback truncates discarded trailing chunks precisely so that stale
//! higher-version headers can never win this scan.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use btree::{LexicographicOrder, Tree};
use format::fletcher::fletcher32;
use format::map::{append_map, format_map, parse_map};
use pagecache::PageCache;

use crate::chunk::{Chunk, CHUNK_HEADER_SIZE};
use crate::error::StoreError;
use crate::file::StoreFile;
use crate::{
    Store, StoreInner, BLOCK_SIZE, DEFAULT_CACHE_MB, DEFAULT_PAGE_SPLIT_SIZE,
    DEFAULT_RETENTION_TIME, META_ID,
};

/// Newest on-disk format this build writes.
const FORMAT_WRITE: u64 = 1;
/// Newest on-disk format this build can read.
const FORMAT_READ: u64 = 1;

/// A header candidate that passed its checksum.
struct HeaderCandidate {
    version: u64,
    map: BTreeMap<String, String>,
}

impl Store {
    pub(crate) fn open_with_config(
        config: BTreeMap<String, String>,
    ) -> Result<Store, StoreError> {
        let Some(file_name) = config.get("fileName").cloned() else {
            return Err(StoreError::InvalidArgument(
                "fileName is required".to_string(),
            ));
        };
        let mut read_only = config.get("openMode").map(String::as_str) == Some("r");
        let cache_mb = config
            .get("cacheSize")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CACHE_MB);

        let path = std::path::PathBuf::from(&file_name);
        if !read_only {
            // Fall back to read-only when the file itself is not writable.
            if let Ok(meta) = std::fs::metadata(&path) {
                if meta.permissions().readonly() {
                    read_only = true;
                }
            }
        }
        let file = StoreFile::open(&path, read_only)?;

        let mut store = Store {
            inner: StoreInner {
                file,
                cache: Mutex::new(PageCache::new(cache_mb * 1024 * 1024)),
                chunks: std::collections::HashMap::new(),
                freed: BTreeMap::new(),
                current_version: 0,
                page_split_size: DEFAULT_PAGE_SPLIT_SIZE,
                unsaved_pages: 0,
            },
            meta: Tree::new(META_ID, 0, Arc::new(LexicographicOrder)),
            trees: std::collections::HashMap::new(),
            changed: std::collections::HashSet::new(),
            header: BTreeMap::new(),
            file_name: path,
            root_chunk_start: 0,
            last_chunk_id: 0,
            last_map_id: 0,
            creation_time: 0,
            retention_time: DEFAULT_RETENTION_TIME,
            reuse_space: true,
            read_only,
            closed: false,
            write_buffer: Vec::new(),
            config,
        };

        match store.finish_open() {
            Ok(()) => Ok(store),
            Err(e) => {
                // Never let Drop shrink a file this open never understood.
                store.closed = true;
                Err(e)
            }
        }
    }

    fn finish_open(&mut self) -> Result<(), StoreError> {
        let store = self;
        if store.inner.file.size() == 0 {
            if store.read_only {
                return Err(StoreError::CorruptHeader);
            }
            store.creation_time = unix_seconds();
            store.header.insert("H".to_string(), "3".to_string());
            store
                .header
                .insert("blockSize".to_string(), BLOCK_SIZE.to_string());
            store
                .header
                .insert("format".to_string(), FORMAT_WRITE.to_string());
            store
                .header
                .insert("creationTime".to_string(), store.creation_time.to_string());
            store.write_file_header()?;
        } else {
            store.read_file_header()?;
            let format_write = format::map::parse_number(&store.header, "format")
                .map_err(|_| StoreError::CorruptHeader)?;
            let format_read = store
                .header
                .get("formatRead")
                .and_then(|s| s.parse().ok())
                .unwrap_or(format_write);
            if format_read > FORMAT_READ {
                return Err(StoreError::UnsupportedReadFormat {
                    format: format_read,
                    supported: FORMAT_READ,
                });
            }
            if format_write > FORMAT_WRITE {
                // Readable but not writable by this build; keep the
                // exclusive lock and refuse writes.
                store.read_only = true;
            }
            if store.root_chunk_start > 0 {
                store.read_meta()?;
            }
        }
        Ok(())
    }

    /// Selects the authoritative header among block 0, block 1, and the
    /// first valid trailing block from the end; highest version wins.
    pub(crate) fn read_file_header(&mut self) -> Result<(), StoreError> {
        let size = self.inner.file.size();
        let full_blocks = size / BLOCK_SIZE;
        let mut best: Option<HeaderCandidate> = None;

        let offer = |candidate: Option<HeaderCandidate>, best: &mut Option<HeaderCandidate>| {
            if let Some(c) = candidate {
                if best.as_ref().is_none_or(|b| c.version > b.version) {
                    *best = Some(c);
                }
            }
        };

        for block in [0, 1] {
            if block < full_blocks {
                offer(self.read_header_block(block)?, &mut best);
            }
        }
        let mut block = full_blocks;
        while block > 2 {
            block -= 1;
            let candidate = self.read_header_block(block)?;
            if candidate.is_some() {
                offer(candidate, &mut best);
                break;
            }
        }

        let Some(mut winner) = best else {
            return Err(StoreError::CorruptHeader);
        };
        winner.map.remove("fletcher");
        let number = |key: &str| {
            format::map::parse_number(&winner.map, key).map_err(|_| StoreError::CorruptHeader)
        };
        self.inner.current_version = winner.version;
        self.root_chunk_start = number("rootChunk")?;
        self.creation_time = number("creationTime")?;
        self.last_map_id = number("lastMapId")? as u32;
        self.header = winner.map;
        Ok(())
    }

    /// Reads one block and parses it as a header candidate; `None` when the
    /// checksum or grammar rejects it.
    fn read_header_block(&self, block: u64) -> Result<Option<HeaderCandidate>, StoreError> {
        let offset = block * BLOCK_SIZE;
        let bytes = self
            .inner
            .file
            .read_at(offset, BLOCK_SIZE as usize)
            .map_err(|e| self.io_error(offset, e))?;
        Ok(parse_header_block(&bytes))
    }

    /// The serialized header: the map plus a trailing `fletcher` entry over
    /// the preceding text padded with one space.
    pub(crate) fn file_header_bytes(&mut self) -> Result<Vec<u8>, StoreError> {
        self.header
            .insert("lastMapId".to_string(), self.last_map_id.to_string());
        self.header
            .insert("rootChunk".to_string(), self.root_chunk_start.to_string());
        self.header
            .insert("version".to_string(), self.inner.current_version.to_string());
        let body = format_map(&self.header);
        let mut checked = body.clone();
        checked.push(' ');
        let bytes = checked.as_bytes();
        let sum = fletcher32(bytes, bytes.len() / 2 * 2);
        let mut full = body;
        append_map(&mut full, "fletcher", &format!("{sum:x}"));
        let out = full.into_bytes();
        if out.len() > BLOCK_SIZE as usize {
            return Err(StoreError::InvalidArgument(format!(
                "file header too large: {} bytes",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Rewrites the two leading header blocks in one write.
    pub(crate) fn write_file_header(&mut self) -> Result<(), StoreError> {
        let bytes = self.file_header_bytes()?;
        let mut buf = vec![0u8; 2 * BLOCK_SIZE as usize];
        buf[..bytes.len()].copy_from_slice(&bytes);
        buf[BLOCK_SIZE as usize..BLOCK_SIZE as usize + bytes.len()].copy_from_slice(&bytes);
        self.inner
            .file
            .write_at(0, &buf)
            .map_err(|e| self.io_error(0, e))
    }

    /// Reads the binary chunk header at `start`.
    pub(crate) fn read_chunk_header(&self, start: u64) -> Result<Chunk, StoreError> {
        let bytes = self
            .inner
            .file
            .read_at(start, CHUNK_HEADER_SIZE)
            .map_err(|e| self.io_error(start, e))?;
        Chunk::read_header(&bytes, start)
    }

    /// Rebuilds the chunk table from the newest chunk's meta tree.
    ///
    /// Every commit rewrites every `chunk.*` entry, so all of them live in
    /// the newest chunk and this iteration never needs a chunk that is not
    /// yet registered.
    pub(crate) fn read_meta(&mut self) -> Result<(), StoreError> {
        let header = self.read_chunk_header(self.root_chunk_start)?;
        self.last_chunk_id = header.id;
        self.inner.chunks.insert(header.id, header.clone());
        self.meta.set_root_pos(&self.inner, header.meta_root_pos)?;

        let mut descriptors = Vec::new();
        for item in self.meta.iter_from(&self.inner, b"chunk.")? {
            let (key, value) = item?;
            if !key.starts_with(b"chunk.") {
                break;
            }
            descriptors.push(String::from_utf8_lossy(&value).into_owned());
        }
        for descriptor in descriptors {
            let mut chunk = Chunk::from_meta_string(&descriptor)?;
            if chunk.id == header.id {
                // The newest chunk's meta entry still holds placeholder
                // accounting; the binary header is authoritative for it.
                chunk.start = header.start;
                chunk.length = header.length;
                chunk.meta_root_pos = header.meta_root_pos;
                chunk.page_count = header.page_count;
                chunk.max_length = header.max_length;
                chunk.max_length_live = header.max_length_live;
            }
            self.last_chunk_id = self.last_chunk_id.max(chunk.id);
            self.inner.chunks.insert(chunk.id, chunk);
        }
        Ok(())
    }
}

fn parse_header_block(bytes: &[u8]) -> Option<HeaderCandidate> {
    let text = String::from_utf8(bytes.to_vec()).ok()?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.is_empty() {
        return None;
    }
    let map = parse_map(trimmed).ok()?;
    let declared = u64::from_str_radix(map.get("fletcher")?, 16).ok()?;
    let fletcher_at = trimmed.rfind(",fletcher:")?;
    let mut preamble = trimmed[..fletcher_at].to_string();
    preamble.push(' ');
    let preamble = preamble.as_bytes();
    let actual = fletcher32(preamble, preamble.len() / 2 * 2);
    if u64::from(actual) != declared {
        return None;
    }
    let version = map.get("version")?.parse().ok()?;
    Some(HeaderCandidate { version, map })
}

pub(crate) fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("H".to_string(), "3".to_string());
        map.insert("version".to_string(), "9".to_string());
        map.insert("rootChunk".to_string(), "8192".to_string());
        let body = format_map(&map);
        let mut checked = body.clone();
        checked.push(' ');
        let sum = fletcher32(checked.as_bytes(), checked.len() / 2 * 2);
        let mut full = body;
        append_map(&mut full, "fletcher", &format!("{sum:x}"));

        let mut block = full.into_bytes();
        block.resize(BLOCK_SIZE as usize, 0);
        let candidate = parse_header_block(&block).expect("valid header rejected");
        assert_eq!(candidate.version, 9);
        assert_eq!(candidate.map.get("rootChunk").unwrap(), "8192");
    }

    #[test]
    fn corrupted_header_block_is_rejected() {
        let mut map = BTreeMap::new();
        map.insert("H".to_string(), "3".to_string());
        map.insert("version".to_string(), "2".to_string());
        let body = format_map(&map);
        let mut checked = body.clone();
        checked.push(' ');
        let sum = fletcher32(checked.as_bytes(), checked.len() / 2 * 2);
        let mut full = body;
        append_map(&mut full, "fletcher", &format!("{sum:x}"));
        let mut block = full.into_bytes();
        block.resize(BLOCK_SIZE as usize, 0);
        block[2] ^= 0x01;
        assert!(parse_header_block(&block).is_none());
    }

    #[test]
    fn garbage_block_is_rejected() {
        assert!(parse_header_block(&[0u8; BLOCK_SIZE as usize]).is_none());
        assert!(parse_header_block(b"not a header at all").is_none());
    }
}
