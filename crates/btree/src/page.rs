//! B-tree pages and their binary form.
//!
//! ## Serialized frame
//!
//! ```text
//! [page_len: u32 LE][check: u16 LE][map_id: varint][key_count: varint][type: u8]
//! node: (key_count + 1) × [child_pos: u64 LE], (key_count + 1) × [count: varint]
//! [key_len: varint][key bytes] × key_count
//! leaf: [value_len: varint][value bytes] × key_count
//! ```
//!
//! `page_len` covers the whole frame including itself. `check` is derived
//! from (chunk id, offset, page_len), so a page read back through a stale or
//! mangled position fails fast. Children are serialized before their parent,
//! which is what lets a parent embed final child positions.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use format::pos as pagepos;
use format::varint::{read_varint, read_varint_u32, write_varint};

use crate::{KeyComparator, PageStore, TreeError};

/// Fixed per-page baseline for the in-memory size estimate.
const PAGE_MEMORY: usize = 128;
/// Estimated overhead per key or value beyond its byte length.
const ENTRY_MEMORY: usize = 32;
/// Estimated overhead per child reference.
const CHILD_MEMORY: usize = 56;

/// Bytes of frame header before the varint fields.
const FRAME_HEADER: usize = 4 + 2;

/// Version tag for pages that were read from disk or belong to an empty,
/// never-written tree; always older than any write version.
pub(crate) const VERSION_UNSET: i64 = -1;

/// A reference from an internal page to one child subtree.
#[derive(Debug, Clone)]
pub(crate) struct ChildRef {
    /// On-disk position; 0 while the child is unsaved.
    pub pos: u64,
    /// Number of entries in the child's subtree.
    pub count: u64,
    /// In-memory child, present for unsaved children and recently loaded
    /// ones that have not been handed to the cache yet.
    pub page: Option<Arc<Page>>,
}

impl ChildRef {
    pub(crate) fn of(page: Arc<Page>) -> Self {
        Self {
            pos: page.pos(),
            count: page.total_count(),
            page: Some(page),
        }
    }
}

#[derive(Debug, Clone)]
enum Content {
    Leaf { values: Vec<Vec<u8>> },
    Node { children: Vec<ChildRef> },
}

/// One B-tree node.
///
/// A page is mutated only while it is exclusively owned (freshly cloned by a
/// copy-on-write step); once wrapped in an `Arc` and installed in a parent
/// or a tree root it is immutable.
#[derive(Debug, Clone)]
pub struct Page {
    map_id: u32,
    version: i64,
    pos: u64,
    total_count: u64,
    memory: usize,
    keys: Vec<Vec<u8>>,
    content: Content,
}

impl Page {
    /// A fresh empty leaf, the root of a tree with no data.
    #[must_use]
    pub fn empty_leaf(map_id: u32) -> Self {
        Self {
            map_id,
            version: VERSION_UNSET,
            pos: 0,
            total_count: 0,
            memory: PAGE_MEMORY,
            keys: Vec::new(),
            content: Content::Leaf { values: Vec::new() },
        }
    }

    pub(crate) fn empty_leaf_versioned(map_id: u32, version: i64) -> Self {
        let mut p = Self::empty_leaf(map_id);
        p.version = version;
        p
    }

    pub(crate) fn new_node(
        map_id: u32,
        version: i64,
        keys: Vec<Vec<u8>>,
        children: Vec<ChildRef>,
    ) -> Self {
        let mut p = Self {
            map_id,
            version,
            pos: 0,
            total_count: 0,
            memory: 0,
            keys,
            content: Content::Node { children },
        };
        p.recompute();
        p
    }

    /// The id of the owning map.
    #[must_use]
    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    /// Write version that created this in-memory page, or -1 for pages read
    /// from disk.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// On-disk position, 0 while unsaved.
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Entries in the whole subtree under this page.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Estimated in-memory footprint, used for cache cost and the split
    /// threshold.
    #[must_use]
    pub fn memory(&self) -> usize {
        self.memory
    }

    /// Whether this is a leaf page.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self.content, Content::Leaf { .. })
    }

    /// Number of keys on this page.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// The key at `index`.
    #[must_use]
    pub fn key(&self, index: usize) -> &[u8] {
        &self.keys[index]
    }

    /// All keys on this page, in order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.keys.iter().map(|k| k.as_slice())
    }

    /// The value at `index`; panics on internal pages.
    #[must_use]
    pub fn value(&self, index: usize) -> &[u8] {
        match &self.content {
            Content::Leaf { values } => &values[index],
            Content::Node { .. } => panic!("value() on an internal page"),
        }
    }

    /// Number of children; 0 for leaves.
    #[must_use]
    pub fn child_count(&self) -> usize {
        match &self.content {
            Content::Leaf { .. } => 0,
            Content::Node { children } => children.len(),
        }
    }

    pub(crate) fn child_pos(&self, index: usize) -> u64 {
        match &self.content {
            Content::Leaf { .. } => unreachable!("child_pos() on a leaf"),
            Content::Node { children } => children[index].pos,
        }
    }

    pub(crate) fn child_page(&self, index: usize) -> Option<Arc<Page>> {
        match &self.content {
            Content::Leaf { .. } => None,
            Content::Node { children } => children[index].page.clone(),
        }
    }

    /// Takes the in-memory child out of its slot, leaving the position.
    pub(crate) fn take_child_page(&mut self, index: usize) -> Option<Arc<Page>> {
        match &mut self.content {
            Content::Leaf { .. } => None,
            Content::Node { children } => children[index].page.take(),
        }
    }

    /// Binary search among this page's keys. `Ok` is an exact match; `Err`
    /// is the insertion point. On internal pages an exact match routes to
    /// child `i + 1` and an insertion point to child `i`.
    pub fn search(&self, cmp: &dyn KeyComparator, key: &[u8]) -> Result<usize, usize> {
        let mut lo = 0;
        let mut hi = self.keys.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp.compare(&self.keys[mid], key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    pub(crate) fn insert_leaf(&mut self, index: usize, key: Vec<u8>, value: Vec<u8>) {
        self.memory += ENTRY_MEMORY * 2 + key.len() + value.len();
        self.total_count += 1;
        match &mut self.content {
            Content::Leaf { values } => values.insert(index, value),
            Content::Node { .. } => unreachable!("insert_leaf() on an internal page"),
        }
        self.keys.insert(index, key);
    }

    /// Replaces the value at `index`, returning the previous one.
    pub(crate) fn set_value(&mut self, index: usize, value: Vec<u8>) -> Vec<u8> {
        match &mut self.content {
            Content::Leaf { values } => {
                self.memory = self.memory + value.len() - values[index].len();
                std::mem::replace(&mut values[index], value)
            }
            Content::Node { .. } => unreachable!("set_value() on an internal page"),
        }
    }

    /// Removes the entry at `index`, returning its value.
    pub(crate) fn remove_leaf(&mut self, index: usize) -> Vec<u8> {
        let key = self.keys.remove(index);
        self.total_count -= 1;
        match &mut self.content {
            Content::Leaf { values } => {
                let value = values.remove(index);
                self.memory -= ENTRY_MEMORY * 2 + key.len() + value.len();
                value
            }
            Content::Node { .. } => unreachable!("remove_leaf() on an internal page"),
        }
    }

    /// Installs `child` in an existing slot, adjusting counts.
    pub(crate) fn set_child(&mut self, index: usize, child: Arc<Page>) {
        match &mut self.content {
            Content::Leaf { .. } => unreachable!("set_child() on a leaf"),
            Content::Node { children } => {
                let old = children[index].count;
                self.total_count = self.total_count - old + child.total_count();
                children[index] = ChildRef::of(child);
            }
        }
    }

    /// Inserts separator `key` and `child` at `index` (the child lands to
    /// the left of the existing child at that slot).
    pub(crate) fn insert_child(&mut self, index: usize, key: Vec<u8>, child: Arc<Page>) {
        self.memory += ENTRY_MEMORY + key.len() + CHILD_MEMORY;
        self.total_count += child.total_count();
        match &mut self.content {
            Content::Leaf { .. } => unreachable!("insert_child() on a leaf"),
            Content::Node { children } => children.insert(index, ChildRef::of(child)),
        }
        self.keys.insert(index, key);
    }

    /// Removes the child at `index` together with its nearest separator key.
    pub(crate) fn remove_child(&mut self, index: usize) {
        if !self.keys.is_empty() {
            let key_index = index.min(self.keys.len() - 1);
            let key = self.keys.remove(key_index);
            self.memory -= ENTRY_MEMORY + key.len();
        }
        match &mut self.content {
            Content::Leaf { .. } => unreachable!("remove_child() on a leaf"),
            Content::Node { children } => {
                let removed = children.remove(index);
                self.total_count -= removed.count;
                self.memory -= CHILD_MEMORY;
            }
        }
    }

    /// Splits this page at `at`, keeping the left half in place and
    /// returning the right half.
    ///
    /// For leaves the key at `at` stays as the first key of the right half;
    /// for internal pages it is removed from both halves (the caller has
    /// already captured it as the separator to promote).
    pub(crate) fn split(&mut self, at: usize) -> Page {
        let right = match &mut self.content {
            Content::Leaf { values } => {
                let right_keys = self.keys.split_off(at);
                let right_values = values.split_off(at);
                Page {
                    map_id: self.map_id,
                    version: self.version,
                    pos: 0,
                    total_count: 0,
                    memory: 0,
                    keys: right_keys,
                    content: Content::Leaf {
                        values: right_values,
                    },
                }
            }
            Content::Node { children } => {
                let right_keys = self.keys.split_off(at + 1);
                self.keys.pop();
                let right_children = children.split_off(at + 1);
                Page {
                    map_id: self.map_id,
                    version: self.version,
                    pos: 0,
                    total_count: 0,
                    memory: 0,
                    keys: right_keys,
                    content: Content::Node {
                        children: right_children,
                    },
                }
            }
        };
        let mut right = right;
        self.recompute();
        right.recompute();
        right
    }

    /// Recomputes `total_count` and `memory` from scratch.
    fn recompute(&mut self) {
        let mut memory = PAGE_MEMORY;
        for k in &self.keys {
            memory += ENTRY_MEMORY + k.len();
        }
        match &self.content {
            Content::Leaf { values } => {
                for v in values {
                    memory += ENTRY_MEMORY + v.len();
                }
                self.total_count = self.keys.len() as u64;
            }
            Content::Node { children } => {
                memory += CHILD_MEMORY * children.len();
                self.total_count = children.iter().map(|c| c.count).sum();
            }
        }
        self.memory = memory;
    }

    pub(crate) fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    pub(crate) fn clear_pos(&mut self) {
        self.pos = 0;
    }

    /// Serializes this page at the current end of `buf` (whose length is the
    /// page's offset within the chunk) and returns its new position.
    fn encode(&self, buf: &mut Vec<u8>, chunk_id: u32) -> u64 {
        let start = buf.len();
        buf.extend_from_slice(&[0u8; FRAME_HEADER]);
        write_varint(buf, u64::from(self.map_id));
        write_varint(buf, self.keys.len() as u64);
        let page_type = if self.is_leaf() {
            pagepos::PAGE_TYPE_LEAF
        } else {
            pagepos::PAGE_TYPE_NODE
        };
        buf.push(page_type);
        if let Content::Node { children } = &self.content {
            for child in children {
                debug_assert!(child.pos != 0, "child serialized after parent");
                let mut raw = [0u8; 8];
                LittleEndian::write_u64(&mut raw, child.pos);
                buf.extend_from_slice(&raw);
            }
            for child in children {
                write_varint(buf, child.count);
            }
        }
        for key in &self.keys {
            write_varint(buf, key.len() as u64);
            buf.extend_from_slice(key);
        }
        if let Content::Leaf { values } = &self.content {
            for value in values {
                write_varint(buf, value.len() as u64);
                buf.extend_from_slice(value);
            }
        }
        let page_len = (buf.len() - start) as u32;
        LittleEndian::write_u32(&mut buf[start..start + 4], page_len);
        let check = check_value(chunk_id, start as u32, page_len);
        LittleEndian::write_u16(&mut buf[start + 4..start + 6], check);
        pagepos::page_pos(chunk_id, start as u32, page_len, page_type)
    }

    /// Deserializes the page at `pos` from `bytes`, which must start at the
    /// page frame and may extend past it (reads are sized by length class).
    pub fn read(bytes: &[u8], pos: u64, expected_map: u32) -> Result<Page, TreeError> {
        let corrupt = |reason| TreeError::CorruptPage { pos, reason };
        if bytes.len() < FRAME_HEADER + 3 {
            return Err(corrupt("truncated frame"));
        }
        let page_len = LittleEndian::read_u32(&bytes[0..4]) as usize;
        if page_len < FRAME_HEADER + 3 || page_len > bytes.len() {
            return Err(corrupt("bad page length"));
        }
        let check = LittleEndian::read_u16(&bytes[4..6]);
        let expected = check_value(pagepos::chunk_id(pos), pagepos::offset(pos), page_len as u32);
        if check != expected {
            return Err(corrupt("check value mismatch"));
        }
        let mut input = &bytes[FRAME_HEADER..page_len];
        let map_id = read_varint_u32(&mut input)?;
        if map_id != expected_map {
            return Err(corrupt("page belongs to another map"));
        }
        let key_count = read_varint_u32(&mut input)? as usize;
        if key_count > page_len {
            return Err(corrupt("bad key count"));
        }
        let (page_type, rest) = input.split_first().ok_or(corrupt("truncated frame"))?;
        input = rest;
        let leaf = *page_type == pagepos::PAGE_TYPE_LEAF;
        if leaf != pagepos::is_leaf(pos) {
            return Err(corrupt("page type does not match position"));
        }
        let content = if leaf {
            Content::Leaf {
                values: Vec::with_capacity(key_count),
            }
        } else {
            let child_count = key_count + 1;
            if input.len() < child_count * 8 {
                return Err(corrupt("truncated child table"));
            }
            let mut children = Vec::with_capacity(child_count);
            for _ in 0..child_count {
                let child_pos = LittleEndian::read_u64(&input[..8]);
                input = &input[8..];
                children.push(ChildRef {
                    pos: child_pos,
                    count: 0,
                    page: None,
                });
            }
            for child in &mut children {
                child.count = read_varint(&mut input)?;
            }
            Content::Node { children }
        };
        let mut page = Page {
            map_id,
            version: VERSION_UNSET,
            pos,
            total_count: 0,
            memory: 0,
            keys: Vec::with_capacity(key_count),
            content,
        };
        for _ in 0..key_count {
            page.keys.push(read_bytes(&mut input, pos)?);
        }
        if let Content::Leaf { values } = &mut page.content {
            for _ in 0..key_count {
                let len = read_varint(&mut input)? as usize;
                if input.len() < len {
                    return Err(corrupt("truncated value"));
                }
                values.push(input[..len].to_vec());
                input = &input[len..];
            }
        }
        page.recompute();
        Ok(page)
    }

    /// Reads a page found while scanning a chunk buffer, synthesizing its
    /// position from the scan offset.
    pub fn read_in_chunk(bytes: &[u8], chunk_id: u32, offset: u32) -> Result<Page, TreeError> {
        let (page_len, _) = Self::peek_frame(bytes, offset)?;
        let type_offset = frame_type_offset(bytes, page_len)?;
        let page_type = bytes[type_offset];
        if page_type > pagepos::PAGE_TYPE_NODE {
            return Err(TreeError::CorruptPage {
                pos: u64::from(offset),
                reason: "bad page type",
            });
        }
        let pos = pagepos::page_pos(chunk_id, offset, page_len, page_type);
        let mut input = &bytes[FRAME_HEADER..];
        let map_id = read_varint_u32(&mut input)?;
        Self::read(bytes, pos, map_id)
    }

    /// Reads just the frame length and map id, for skipping pages of maps
    /// that no longer exist.
    pub fn peek_frame(bytes: &[u8], offset: u32) -> Result<(u32, u32), TreeError> {
        if bytes.len() < FRAME_HEADER + 3 {
            return Err(TreeError::CorruptPage {
                pos: u64::from(offset),
                reason: "truncated frame",
            });
        }
        let page_len = LittleEndian::read_u32(&bytes[0..4]);
        if (page_len as usize) < FRAME_HEADER + 3 || page_len as usize > bytes.len() {
            return Err(TreeError::CorruptPage {
                pos: u64::from(offset),
                reason: "bad page length",
            });
        }
        let mut input = &bytes[FRAME_HEADER..];
        let map_id = read_varint_u32(&mut input)?;
        Ok((page_len, map_id))
    }
}

/// Offset of the type byte within a frame: after the header and the two
/// leading varints.
fn frame_type_offset(bytes: &[u8], page_len: u32) -> Result<usize, TreeError> {
    let mut input = &bytes[FRAME_HEADER..page_len as usize];
    let before = input.len();
    read_varint(&mut input)?;
    read_varint(&mut input)?;
    if input.is_empty() {
        return Err(TreeError::CorruptPage {
            pos: 0,
            reason: "truncated frame",
        });
    }
    Ok(FRAME_HEADER + (before - input.len()))
}

fn read_bytes(input: &mut &[u8], pos: u64) -> Result<Vec<u8>, TreeError> {
    let len = read_varint(input)? as usize;
    if input.len() < len {
        return Err(TreeError::CorruptPage {
            pos,
            reason: "truncated key",
        });
    }
    let out = input[..len].to_vec();
    *input = &input[len..];
    Ok(out)
}

/// Check value binding a page frame to its chunk, offset, and length.
fn check_value(chunk_id: u32, offset: u32, page_len: u32) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&chunk_id.to_le_bytes());
    hasher.update(&offset.to_le_bytes());
    hasher.update(&page_len.to_le_bytes());
    (hasher.finalize() & 0xffff) as u16
}

/// Space accounting gathered while serializing one chunk's pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteStats {
    /// Pages appended.
    pub page_count: u32,
    /// Sum of length-class capacities of the appended pages.
    pub max_length: i64,
    /// Same as `max_length` at write time; diverges later as pages die.
    pub max_length_live: i64,
}

/// Serializes every unsaved page under `page` into `buf` (children first),
/// returning the persisted replacement for `page`.
///
/// Newly written pages are offered to the cache and their in-memory child
/// links are dropped, so resident memory is governed by the cache budget
/// from that point on.
pub fn write_unsaved_recursive(
    page: &Arc<Page>,
    chunk_id: u32,
    buf: &mut Vec<u8>,
    stats: &mut WriteStats,
    store: &mut dyn PageStore,
) -> Arc<Page> {
    if page.pos() != 0 {
        return Arc::clone(page);
    }
    let mut p = (**page).clone();
    if let Content::Node { children } = &mut p.content {
        for child in children.iter_mut() {
            if let Some(live) = &child.page {
                if live.pos() == 0 {
                    let written = write_unsaved_recursive(live, chunk_id, buf, stats, store);
                    child.pos = written.pos();
                    child.count = written.total_count();
                }
                child.page = None;
            }
        }
    }
    let pos = p.encode(buf, chunk_id);
    p.pos = pos;
    stats.page_count += 1;
    let class = i64::from(pagepos::max_length(pos));
    stats.max_length += class;
    stats.max_length_live += class;
    let written = Arc::new(p);
    store.cache_written_page(pos, &written);
    written
}
