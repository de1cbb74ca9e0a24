use anyhow::Result;
use tempfile::tempdir;

use super::helpers::{fill, key, open, value};

// --------------------- Compaction ---------------------

#[test]
fn compaction_is_skipped_while_the_file_is_dense() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("dense.tkv"))?;
    store.set_retention_time(0);
    let t = store.open_tree("t")?;
    fill(&mut store, t, 0..500, 256)?;
    store.commit()?;

    // Everything is live; nothing to collect.
    assert!(!store.compact(80)?);
    Ok(())
}

#[test]
fn compaction_reclaims_a_mostly_dead_chunk() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("reclaim.tkv"))?;
    let t = store.open_tree("t")?;

    // Chunk 1: a large batch. Chunk 2: a small one.
    fill(&mut store, t, 0..4000, 1024)?;
    store.commit()?;
    fill(&mut store, t, 4000..4100, 1024)?;
    store.commit()?;

    // Kill 90% of the first batch (a contiguous range, so the surviving
    // keys' leaves stay where they were), then persist the deletions.
    for i in 0..3600 {
        store.remove(t, &key(i))?;
    }
    store.commit()?;

    store.set_retention_time(0);
    let size_before = store.file_size();
    assert!(store.compact(80)?, "compaction refused to run");

    // The original big chunk has no live pages left and is gone.
    assert_eq!(store.meta_value("chunk.1")?, None);

    // Every surviving key is intact.
    for i in 3600..4100 {
        assert_eq!(store.get(t, &key(i))?, Some(value(i, 1024)));
    }
    assert_eq!(store.len(t)?, 500);

    // Rewriting the live set pushes it into fresh chunks; the follow-up
    // commits let the sweep drop the old tail and shrink the file.
    let live: Vec<(Vec<u8>, Vec<u8>)> = store.iter(t)?.collect::<Result<_, _>>()?;
    for (k, v) in &live {
        store.put(t, k, v)?;
    }
    store.commit()?;
    store.put(t, b"nudge", b"1")?;
    store.commit()?;
    store.put(t, b"nudge", b"2")?;
    store.commit()?;

    assert!(
        store.file_size() < size_before,
        "file did not shrink: {} >= {}",
        store.file_size(),
        size_before
    );
    for i in 3600..4100 {
        assert_eq!(store.get(t, &key(i))?, Some(value(i, 1024)));
    }
    Ok(())
}

#[test]
fn compaction_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("reopen.tkv");
    {
        let mut store = open(&path)?;
        let t = store.open_tree("t")?;
        fill(&mut store, t, 0..1000, 512)?;
        store.commit()?;
        for i in 0..900 {
            store.remove(t, &key(i))?;
        }
        store.commit()?;
        store.set_retention_time(0);
        store.compact(80)?;
        store.close()?;
    }

    let mut store = open(&path)?;
    let t = store.open_tree("t")?;
    assert_eq!(store.len(t)?, 100);
    for i in 900..1000 {
        assert_eq!(store.get(t, &key(i))?, Some(value(i, 512)));
    }
    Ok(())
}

#[test]
fn append_only_mode_never_reuses_freed_space() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("append.tkv"))?;
    store.set_retention_time(0);
    store.set_reuse_space(false);
    let t = store.open_tree("t")?;

    fill(&mut store, t, 0..100, 256)?;
    store.commit()?;
    let mut last_end = store.file_size();
    for round in 0..3u32 {
        fill(&mut store, t, 0..100, 256 + round as usize)?;
        store.commit()?;
        assert!(
            store.file_size() > last_end,
            "append-only commit reused space"
        );
        last_end = store.file_size();
    }
    Ok(())
}
