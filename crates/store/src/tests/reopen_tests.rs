use anyhow::Result;
use tempfile::tempdir;

use super::helpers::{fill, key, open, value};
use crate::{Builder, StoreError};

// --------------------- Round trips ---------------------

#[test]
fn first_commit_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("s1.tkv");

    {
        let mut store = open(&path)?;
        assert_eq!(store.current_version(), 0);
        let x = store.open_tree("x")?;
        store.put(x, b"a", b"1")?;
        let version = store.commit()?;
        assert_eq!(version, 1);
        store.close()?;
    }

    let mut store = open(&path)?;
    assert_eq!(store.current_version(), 1);
    assert_eq!(store.last_chunk_id(), 1);
    let x = store.open_tree("x")?;
    assert_eq!(store.get(x, b"a")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn latest_commit_wins_for_every_key() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("latest.tkv");

    {
        let mut store = open(&path)?;
        let t = store.open_tree("data")?;
        fill(&mut store, t, 0..300, 64)?;
        store.commit()?;
        // Overwrite a third, delete a third, across two more commits.
        for i in 0..100 {
            store.put(t, &key(i), b"overwritten")?;
        }
        store.commit()?;
        for i in 100..200 {
            store.remove(t, &key(i))?;
        }
        store.commit()?;
        store.close()?;
    }

    let mut store = open(&path)?;
    let t = store.open_tree("data")?;
    assert_eq!(store.len(t)?, 200);
    for i in 0..100 {
        assert_eq!(store.get(t, &key(i))?, Some(b"overwritten".to_vec()));
    }
    for i in 100..200 {
        assert_eq!(store.get(t, &key(i))?, None);
    }
    for i in 200..300 {
        assert_eq!(store.get(t, &key(i))?, Some(value(i, 64)));
    }
    Ok(())
}

#[test]
fn several_trees_share_one_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("multi.tkv");

    {
        let mut store = open(&path)?;
        let a = store.open_tree("a")?;
        let b = store.open_tree("b")?;
        store.put(a, b"k", b"from-a")?;
        store.put(b, b"k", b"from-b")?;
        store.commit()?;
        store.close()?;
    }

    let mut store = open(&path)?;
    let a = store.open_tree("a")?;
    let b = store.open_tree("b")?;
    assert_ne!(a, b);
    assert_eq!(store.get(a, b"k")?, Some(b"from-a".to_vec()));
    assert_eq!(store.get(b, b"k")?, Some(b"from-b".to_vec()));
    assert_eq!(store.tree_name(a)?, "a");
    assert_eq!(store.tree_name(b)?, "b");
    Ok(())
}

#[test]
fn iteration_order_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("order.tkv");

    {
        let mut store = open(&path)?;
        let t = store.open_tree("sorted")?;
        // Insert in reverse to make the on-disk order do the work.
        for i in (0..500).rev() {
            store.put(t, &key(i), &value(i, 16))?;
        }
        store.commit()?;
        store.close()?;
    }

    let mut store = open(&path)?;
    let t = store.open_tree("sorted")?;
    let entries: Vec<_> = store.iter(t)?.collect::<Result<_, _>>()?;
    assert_eq!(entries.len(), 500);
    for (i, (k, _)) in entries.iter().enumerate() {
        assert_eq!(k, &key(i as u32));
    }
    let from: Vec<_> = store.iter_from(t, &key(490))?.collect::<Result<_, _>>()?;
    assert_eq!(from.len(), 10);
    Ok(())
}

#[test]
fn store_version_is_persisted() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sv.tkv");
    {
        let mut store = open(&path)?;
        assert_eq!(store.store_version()?, 0);
        store.set_store_version(7)?;
        store.commit()?;
        store.close()?;
    }
    let store = open(&path)?;
    assert_eq!(store.store_version()?, 7);
    Ok(())
}

// --------------------- Locking and read-only ---------------------

#[test]
fn second_writer_is_locked_out() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("locked.tkv");
    let _store = open(&path)?;
    match Builder::new().file_name(&path).open() {
        Err(StoreError::Locked(_)) => {}
        other => panic!("expected Locked, got {other:?}"),
    }
    Ok(())
}

#[test]
fn read_only_open_reads_but_rejects_writes() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ro.tkv");
    {
        let mut store = open(&path)?;
        let t = store.open_tree("t")?;
        store.put(t, b"k", b"v")?;
        store.commit()?;
        store.close()?;
    }

    let mut store = Builder::new().file_name(&path).read_only().open()?;
    assert!(store.is_read_only());
    let t = store.open_tree("t")?;
    assert_eq!(store.get(t, b"k")?, Some(b"v".to_vec()));
    assert!(matches!(
        store.put(t, b"k", b"w"),
        Err(StoreError::ReadOnly)
    ));
    assert!(matches!(store.commit(), Err(StoreError::ReadOnly)));
    // Creating a tree would modify the meta tree.
    assert!(matches!(
        store.open_tree("new"),
        Err(StoreError::ReadOnly)
    ));
    Ok(())
}

#[test]
fn two_readers_may_share_the_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("shared.tkv");
    {
        let mut store = open(&path)?;
        let t = store.open_tree("t")?;
        store.put(t, b"k", b"v")?;
        store.commit()?;
        store.close()?;
    }
    let mut r1 = Builder::new().file_name(&path).read_only().open()?;
    let mut r2 = Builder::new().file_name(&path).read_only().open()?;
    let t1 = r1.open_tree("t")?;
    let t2 = r2.open_tree("t")?;
    assert_eq!(r1.get(t1, b"k")?, r2.get(t2, b"k")?);
    Ok(())
}
