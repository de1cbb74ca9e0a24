use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Result;
use tempfile::tempdir;

use super::helpers::{fill, key, open};
use crate::{StoreError, BLOCK_SIZE};

fn truncate_file(path: &Path, len: u64) -> Result<()> {
    let f = OpenOptions::new().write(true).open(path)?;
    f.set_len(len)?;
    Ok(())
}

fn patch_file(path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new().write(true).open(path)?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(bytes)?;
    Ok(())
}

/// Two commits; returns the file length right after the first one.
fn two_commit_store(path: &Path) -> Result<u64> {
    let mut store = open(path)?;
    let t = store.open_tree("t")?;
    fill(&mut store, t, 0..50, 64)?;
    store.commit()?;
    let after_first = store.file_size();
    fill(&mut store, t, 50..100, 64)?;
    store.commit()?;
    // Both chunks were appended, so shrink-on-close leaves the layout as is.
    drop(store);
    Ok(after_first)
}

// --------------------- Truncation prefixes ---------------------

#[test]
fn truncating_at_a_chunk_boundary_reverts_to_that_commit() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cut.tkv");
    let first_end = two_commit_store(&path)?;

    truncate_file(&path, first_end)?;
    let mut store = open(&path)?;
    assert_eq!(store.current_version(), 1);
    let t = store.open_tree("t")?;
    assert_eq!(store.len(t)?, 50);
    assert!(store.get(t, &key(0))?.is_some());
    assert_eq!(store.get(t, &key(50))?, None);
    Ok(())
}

#[test]
fn truncating_inside_the_next_chunk_reverts_to_the_previous_commit() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("mid.tkv");
    let first_end = two_commit_store(&path)?;

    // Land inside the second chunk's bytes, past the first chunk's trailing
    // header block.
    truncate_file(&path, first_end + 1000)?;
    let mut store = open(&path)?;
    assert_eq!(store.current_version(), 1);
    let t = store.open_tree("t")?;
    assert_eq!(store.len(t)?, 50);
    Ok(())
}

#[test]
fn a_partial_trailing_write_is_ignored() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("torn.tkv");
    two_commit_store(&path)?;

    // Emulate a torn chunk append: garbage after the last valid block.
    let len = std::fs::metadata(&path)?.len();
    patch_file(&path, len, &vec![0xabu8; 5000])?;

    let mut store = open(&path)?;
    assert_eq!(store.current_version(), 2);
    let t = store.open_tree("t")?;
    assert_eq!(store.len(t)?, 100);
    Ok(())
}

// --------------------- Header corruption ---------------------

#[test]
fn one_corrupt_header_copy_is_tolerated() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("flip0.tkv");
    two_commit_store(&path)?;

    // Flip bytes inside block 0's preamble.
    patch_file(&path, 20, &[0xff; 8])?;

    let mut store = open(&path)?;
    assert_eq!(store.current_version(), 2);
    let t = store.open_tree("t")?;
    assert_eq!(store.len(t)?, 100);
    Ok(())
}

#[test]
fn both_leading_copies_corrupt_still_opens_from_the_tail() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("flip01.tkv");
    two_commit_store(&path)?;

    patch_file(&path, 20, &[0xff; 16])?;
    patch_file(&path, BLOCK_SIZE + 20, &[0xff; 16])?;

    let mut store = open(&path)?;
    assert_eq!(store.current_version(), 2);
    let t = store.open_tree("t")?;
    assert_eq!(store.len(t)?, 100);
    Ok(())
}

#[test]
fn a_file_with_no_valid_header_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("garbage.tkv");
    std::fs::write(&path, vec![0xaau8; BLOCK_SIZE as usize])?;

    match open(&path) {
        Err(e) => match e.downcast_ref::<StoreError>() {
            Some(StoreError::CorruptHeader) => {}
            other => panic!("expected CorruptHeader, got {other:?}"),
        },
        Ok(_) => panic!("garbage file opened"),
    }
    // The failed open must not have modified the file.
    assert_eq!(std::fs::metadata(&path)?.len(), BLOCK_SIZE);
    Ok(())
}

#[test]
fn header_corruption_does_not_leak_into_data() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("verify.tkv");
    two_commit_store(&path)?;
    // NUL bytes keep the block valid UTF-8, so rejection must come from the
    // checksum itself.
    patch_file(&path, 30, &[0x00; 32])?;

    let mut store = open(&path)?;
    let t = store.open_tree("t")?;
    for i in 0..100 {
        assert!(store.get(t, &key(i))?.is_some(), "lost key {i}");
    }
    Ok(())
}
