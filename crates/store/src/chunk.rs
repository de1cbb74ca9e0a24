//! Chunk descriptors and their two serialized forms.
//!
//! A chunk is one commit's worth of pages: a block-aligned byte range that
//! is immutable once written. Each descriptor exists in two places:
//!
//! - a 40-byte binary header at the very start of the chunk region, so
//!   recovery can locate the meta root without having the meta tree yet;
//! - a textual `key:value,…` entry under `chunk.<id>` in the meta tree,
//!   which additionally carries `start`, `time`, and `version`.
//!
//! Only `max_length_live` changes after the chunk is written, and only in
//! memory and in the meta entry; the bytes on disk never change.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use format::map::{append_map, parse_map, parse_number};

use crate::error::StoreError;

/// Reserved size of the binary chunk header.
pub(crate) const CHUNK_HEADER_SIZE: usize = 40;

const CHUNK_MAGIC: u8 = b'c';

/// Descriptor of one chunk.
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    pub id: u32,
    /// Byte offset of the chunk region in the file; `u64::MAX` until the
    /// commit that creates the chunk picks a location.
    pub start: u64,
    /// Length of the chunk content in bytes (header plus pages, without the
    /// padding and the trailing header block); `u32::MAX` until known.
    pub length: u32,
    pub page_count: u32,
    /// Sum of the length-class capacities of all pages ever written here.
    pub max_length: i64,
    /// Same sum over the pages still referenced by the newest version.
    pub max_length_live: i64,
    pub meta_root_pos: u64,
    pub version: u64,
    /// Seconds since store creation at commit time; never decreases across
    /// chunks.
    pub time: u64,
    /// Compaction ordering key, lower collects first. Transient.
    pub collect_priority: i64,
}

impl Chunk {
    /// A placeholder descriptor for the chunk the running commit is building.
    pub fn new(id: u32, version: u64, time: u64) -> Self {
        Self {
            id,
            start: u64::MAX,
            length: u32::MAX,
            page_count: 0,
            max_length: i64::MAX,
            max_length_live: i64::MAX,
            meta_root_pos: 0,
            version,
            time,
            collect_priority: 0,
        }
    }

    /// Live bytes as a percentage of nominal bytes, 0–100.
    pub fn fill_rate(&self) -> i64 {
        if self.max_length <= 0 || self.max_length_live <= 0 {
            0
        } else {
            (100 * self.max_length_live / self.max_length).min(100)
        }
    }

    /// Serializes the binary header into `out` (at least
    /// [`CHUNK_HEADER_SIZE`] bytes, zero-padded).
    pub fn write_header(&self, out: &mut [u8]) {
        out[..CHUNK_HEADER_SIZE].fill(0);
        out[0] = CHUNK_MAGIC;
        LittleEndian::write_u32(&mut out[2..6], self.id);
        LittleEndian::write_u32(&mut out[6..10], self.page_count);
        LittleEndian::write_u32(&mut out[10..14], self.length);
        LittleEndian::write_u64(&mut out[14..22], self.meta_root_pos);
        LittleEndian::write_i64(&mut out[22..30], self.max_length);
        LittleEndian::write_i64(&mut out[30..38], self.max_length_live);
    }

    /// Parses a binary header read from `start`.
    pub fn read_header(bytes: &[u8], start: u64) -> Result<Self, StoreError> {
        if bytes.len() < CHUNK_HEADER_SIZE || bytes[0] != CHUNK_MAGIC {
            return Err(StoreError::Corrupt(format!(
                "no chunk header at offset {start}"
            )));
        }
        Ok(Self {
            id: LittleEndian::read_u32(&bytes[2..6]),
            start,
            length: LittleEndian::read_u32(&bytes[10..14]),
            page_count: LittleEndian::read_u32(&bytes[6..10]),
            max_length: LittleEndian::read_i64(&bytes[22..30]),
            max_length_live: LittleEndian::read_i64(&bytes[30..38]),
            meta_root_pos: LittleEndian::read_u64(&bytes[14..22]),
            version: 0,
            time: 0,
            collect_priority: 0,
        })
    }

    /// The textual form stored under `chunk.<id>` in the meta tree.
    pub fn to_meta_string(&self) -> String {
        let mut buf = String::new();
        append_map(&mut buf, "id", &self.id.to_string());
        append_map(&mut buf, "start", &self.start.to_string());
        append_map(&mut buf, "length", &self.length.to_string());
        append_map(&mut buf, "pageCount", &self.page_count.to_string());
        append_map(&mut buf, "maxLength", &self.max_length.to_string());
        append_map(&mut buf, "maxLengthLive", &self.max_length_live.to_string());
        append_map(&mut buf, "metaRoot", &self.meta_root_pos.to_string());
        append_map(&mut buf, "time", &self.time.to_string());
        append_map(&mut buf, "version", &self.version.to_string());
        buf
    }

    /// Parses the textual form.
    pub fn from_meta_string(s: &str) -> Result<Self, StoreError> {
        let map: BTreeMap<String, String> = parse_map(s)?;
        Ok(Self {
            id: parse_number(&map, "id")? as u32,
            start: parse_number(&map, "start")?,
            length: parse_number(&map, "length")? as u32,
            page_count: parse_number(&map, "pageCount")? as u32,
            max_length: parse_number(&map, "maxLength")? as i64,
            max_length_live: parse_number(&map, "maxLengthLive")? as i64,
            meta_root_pos: parse_number(&map, "metaRoot")?,
            time: parse_number(&map, "time")?,
            version: parse_number(&map, "version")?,
            collect_priority: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Chunk {
        Chunk {
            id: 17,
            start: 3 * 4096,
            length: 9000,
            page_count: 12,
            max_length: 10240,
            max_length_live: 8192,
            meta_root_pos: 0xdead_beef,
            version: 42,
            time: 7,
            collect_priority: 0,
        }
    }

    #[test]
    fn binary_header_round_trip() {
        let c = sample();
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        c.write_header(&mut buf);
        let back = Chunk::read_header(&buf, c.start).unwrap();
        assert_eq!(back.id, c.id);
        assert_eq!(back.start, c.start);
        assert_eq!(back.length, c.length);
        assert_eq!(back.page_count, c.page_count);
        assert_eq!(back.max_length, c.max_length);
        assert_eq!(back.max_length_live, c.max_length_live);
        assert_eq!(back.meta_root_pos, c.meta_root_pos);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        sample().write_header(&mut buf);
        buf[0] = b'x';
        assert!(Chunk::read_header(&buf, 0).is_err());
    }

    #[test]
    fn meta_string_round_trip() {
        let c = sample();
        let back = Chunk::from_meta_string(&c.to_meta_string()).unwrap();
        assert_eq!(back.id, c.id);
        assert_eq!(back.start, c.start);
        assert_eq!(back.length, c.length);
        assert_eq!(back.version, c.version);
        assert_eq!(back.time, c.time);
        assert_eq!(back.max_length_live, c.max_length_live);
    }

    #[test]
    fn placeholder_sentinels_survive_the_meta_string() {
        let c = Chunk::new(3, 9, 1);
        let back = Chunk::from_meta_string(&c.to_meta_string()).unwrap();
        assert_eq!(back.start, u64::MAX);
        assert_eq!(back.length, u32::MAX);
        assert_eq!(back.max_length, i64::MAX);
    }

    #[test]
    fn fill_rate_bounds() {
        let mut c = sample();
        assert_eq!(c.fill_rate(), 80);
        c.max_length_live = 0;
        assert_eq!(c.fill_rate(), 0);
        c.max_length_live = c.max_length;
        assert_eq!(c.fill_rate(), 100);
    }
}
