use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::{Store, TreeId};

pub fn open(path: &Path) -> Result<Store> {
    Ok(Store::open(path)?)
}

pub fn key(i: u32) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}

pub fn value(i: u32, size: usize) -> Vec<u8> {
    let mut v = format!("value-{i}-").into_bytes();
    v.resize(size, b'x');
    v
}

/// Inserts `range` keys with values of `size` bytes.
pub fn fill(store: &mut Store, tree: TreeId, range: std::ops::Range<u32>, size: usize) -> Result<()> {
    for i in range {
        store.put(tree, &key(i), &value(i, size))?;
    }
    Ok(())
}

/// Parses every non-placeholder chunk descriptor out of the meta tree.
pub fn chunk_descriptors(store: &Store) -> Result<Vec<BTreeMap<String, String>>> {
    let mut out = Vec::new();
    for id in 0..=store.last_chunk_id() {
        if let Some(s) = store.meta_value(&format!("chunk.{id}"))? {
            out.push(format::map::parse_map(&s)?);
        }
    }
    Ok(out)
}
