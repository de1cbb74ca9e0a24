use anyhow::Result;
use tempfile::tempdir;

use super::helpers::{chunk_descriptors, fill, key, open};
use crate::BLOCK_SIZE;

// --------------------- Idempotence ---------------------

#[test]
fn commit_without_changes_is_a_no_op() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("noop.tkv"))?;
    let t = store.open_tree("t")?;
    store.put(t, b"k", b"v")?;
    let v1 = store.commit()?;

    let writes = store.file_write_count();
    let v2 = store.commit()?;
    assert_eq!(v1, v2);
    assert_eq!(store.file_write_count(), writes, "second commit did I/O");
    assert!(!store.has_unsaved_changes());
    Ok(())
}

// --------------------- Monotonicity ---------------------

#[test]
fn versions_and_chunk_ids_strictly_increase() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("mono.tkv"))?;
    let t = store.open_tree("t")?;

    let mut last_version = store.current_version();
    let mut last_chunk = store.last_chunk_id();
    for round in 0..8u32 {
        store.put(t, &key(round), b"v")?;
        let version = store.commit()?;
        assert!(version > last_version);
        assert!(store.last_chunk_id() > last_chunk);
        last_version = version;
        last_chunk = store.last_chunk_id();
    }

    // Chunk versions themselves are monotonic in the chunk id.
    let mut descriptors = chunk_descriptors(&store)?;
    descriptors.sort_by_key(|d| d["id"].parse::<u32>().unwrap());
    let versions: Vec<u64> = descriptors
        .iter()
        .map(|d| d["version"].parse().unwrap())
        .collect();
    for pair in versions.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    Ok(())
}

// --------------------- Layout invariants ---------------------

#[test]
fn chunks_never_overlap_nor_touch_the_header_blocks() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("layout.tkv"))?;
    let t = store.open_tree("t")?;

    // Mixed workload with deletions so space reuse kicks in.
    store.set_retention_time(0);
    for round in 0..6u32 {
        fill(&mut store, t, round * 100..round * 100 + 100, 128)?;
        if round % 2 == 1 {
            for i in (round - 1) * 100..round * 100 {
                store.remove(t, &key(i))?;
            }
        }
        store.commit()?;
    }

    let mut extents: Vec<(u64, u64)> = Vec::new();
    for d in chunk_descriptors(&store)? {
        let start: u64 = d["start"].parse().unwrap();
        let length: u64 = d["length"].parse().unwrap();
        if start == u64::MAX {
            // The newest chunk's descriptor is finalized by the next commit.
            continue;
        }
        assert!(start >= 2 * BLOCK_SIZE, "chunk in the header blocks");
        assert_eq!(start % BLOCK_SIZE, 0, "chunk start not block-aligned");
        extents.push((start, start + length));
    }
    extents.sort_unstable();
    for pair in extents.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "chunk ranges overlap: {pair:?}");
    }
    Ok(())
}

#[test]
fn live_accounting_stays_within_bounds() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("acct.tkv"))?;
    let t = store.open_tree("t")?;

    fill(&mut store, t, 0..400, 256)?;
    store.commit()?;
    for i in 0..200 {
        store.remove(t, &key(i))?;
    }
    store.commit()?;
    for i in 200..400 {
        store.put(t, &key(i), b"rewritten")?;
    }
    store.commit()?;

    for d in chunk_descriptors(&store)? {
        let max: i64 = d["maxLength"].parse().unwrap();
        let live: i64 = d["maxLengthLive"].parse().unwrap();
        assert!(live >= 0, "negative live bytes: {d:?}");
        assert!(live <= max, "live exceeds nominal: {d:?}");
    }
    Ok(())
}

// --------------------- Space reclamation ---------------------

#[test]
fn dead_chunks_are_dropped_once_past_retention() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("drop.tkv"))?;
    store.set_retention_time(0);
    let t = store.open_tree("t")?;

    fill(&mut store, t, 0..200, 128)?;
    store.commit()?;
    // Rewrite everything: the first chunk's pages all die.
    fill(&mut store, t, 0..200, 64)?;
    store.commit()?;
    // The rewrite commit already frees chunk 1; one more commit performs
    // the sweep that drops it.
    store.put(t, b"extra", b"1")?;
    store.commit()?;

    assert_eq!(store.meta_value("chunk.1")?, None, "chunk 1 still listed");
    assert!(store.chunk_count() < 3);
    Ok(())
}

#[test]
fn retention_keeps_dead_chunks_alive() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("retain.tkv"))?;
    // Default retention is far longer than this test.
    let t = store.open_tree("t")?;
    fill(&mut store, t, 0..100, 128)?;
    store.commit()?;
    fill(&mut store, t, 0..100, 64)?;
    store.commit()?;
    store.put(t, b"extra", b"1")?;
    store.commit()?;

    assert!(
        store.meta_value("chunk.1")?.is_some(),
        "young dead chunk was dropped inside the retention window"
    );
    Ok(())
}

// --------------------- Unsaved page estimate ---------------------

#[test]
fn unsaved_pages_reset_after_commit() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("unsaved.tkv"))?;
    let t = store.open_tree("t")?;
    fill(&mut store, t, 0..100, 64)?;
    assert!(store.unsaved_page_count() > 0);
    store.commit()?;
    assert_eq!(store.unsaved_page_count(), 0);
    Ok(())
}
