use anyhow::Result;
use tempfile::tempdir;

use super::helpers::open;
use crate::StoreError;

// --------------------- Historical reads ---------------------

#[test]
fn each_version_reads_as_of_its_commit() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("hist.tkv"))?;
    let x = store.open_tree("x")?;

    store.put(x, b"a", b"1")?;
    assert_eq!(store.commit()?, 1);
    store.put(x, b"a", b"2")?;
    store.put(x, b"b", b"only-v2")?;
    assert_eq!(store.commit()?, 2);
    store.put(x, b"a", b"3")?;
    store.remove(x, b"b")?;
    assert_eq!(store.commit()?, 3);

    let v1 = store.open_tree_version(x, 1)?;
    let v2 = store.open_tree_version(x, 2)?;
    let v3 = store.open_tree_version(x, 3)?;

    assert_eq!(v1.get(&store, b"a")?, Some(b"1".to_vec()));
    assert_eq!(v1.get(&store, b"b")?, None);
    assert_eq!(v2.get(&store, b"a")?, Some(b"2".to_vec()));
    assert_eq!(v2.get(&store, b"b")?, Some(b"only-v2".to_vec()));
    assert_eq!(v3.get(&store, b"a")?, Some(b"3".to_vec()));
    assert_eq!(v3.get(&store, b"b")?, None);

    // The live tree still reads the newest state.
    assert_eq!(store.get(x, b"a")?, Some(b"3".to_vec()));

    // Snapshots iterate their own version.
    let v2_entries: Vec<_> = v2.iter(&store)?.collect::<Result<_, _>>()?;
    assert_eq!(v2_entries.len(), 2);
    assert_eq!(v2.len(), 2);
    Ok(())
}

#[test]
fn snapshot_of_current_version_excludes_pending_writes() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("pending.tkv"))?;
    let x = store.open_tree("x")?;
    store.put(x, b"a", b"committed")?;
    store.commit()?;

    store.put(x, b"a", b"pending")?;
    let snap = store.open_tree_version(x, 1)?;
    assert_eq!(snap.get(&store, b"a")?, Some(b"committed".to_vec()));
    assert_eq!(store.get(x, b"a")?, Some(b"pending".to_vec()));
    Ok(())
}

#[test]
fn unknown_versions_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("unknown.tkv"))?;
    let x = store.open_tree("x")?;
    store.put(x, b"a", b"1")?;
    store.commit()?;

    assert!(matches!(
        store.open_tree_version(x, 99),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.rollback_to(99),
        Err(StoreError::InvalidArgument(_))
    ));
    Ok(())
}

// --------------------- Rollback ---------------------

#[test]
fn rollback_below_a_commit_is_persisted() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rb.tkv");
    {
        let mut store = open(&path)?;
        let x = store.open_tree("x")?;
        store.put(x, b"a", b"1")?;
        store.commit()?;
        store.put(x, b"a", b"2")?;
        store.commit()?;
        store.put(x, b"a", b"3")?;
        store.commit()?;

        store.rollback_to(2)?;
        assert_eq!(store.current_version(), 2);
        assert_eq!(store.get(x, b"a")?, Some(b"2".to_vec()));

        // The next commit continues from the rolled-back version.
        store.put(x, b"a", b"9")?;
        assert_eq!(store.commit()?, 3);
        store.close()?;
    }

    let mut store = open(&path)?;
    assert_eq!(store.current_version(), 3);
    let x = store.open_tree("x")?;
    assert_eq!(store.get(x, b"a")?, Some(b"9".to_vec()));
    Ok(())
}

#[test]
fn rollback_to_current_discards_uncommitted_changes() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("rbcur.tkv"))?;
    let x = store.open_tree("x")?;
    store.put(x, b"a", b"1")?;
    store.commit()?;

    store.put(x, b"a", b"dirty")?;
    store.put(x, b"b", b"dirty")?;
    assert!(store.has_unsaved_changes());
    store.rollback_to(1)?;
    assert_eq!(store.current_version(), 1);
    assert_eq!(store.get(x, b"a")?, Some(b"1".to_vec()));
    assert_eq!(store.get(x, b"b")?, None);
    Ok(())
}

#[test]
fn rollback_matches_the_historical_view() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("rbeq.tkv"))?;
    let x = store.open_tree("x")?;
    for i in 0..50u32 {
        store.put(x, format!("k{i}").as_bytes(), format!("v{i}").as_bytes())?;
    }
    store.commit()?;
    for i in 0..50u32 {
        store.put(x, format!("k{i}").as_bytes(), b"changed")?;
    }
    store.commit()?;

    let before: Vec<_> = store
        .open_tree_version(x, 1)?
        .iter(&store)?
        .collect::<Result<_, _>>()?;
    store.rollback_to(1)?;
    let after: Vec<_> = store.iter(x)?.collect::<Result<_, _>>()?;
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn rollback_closes_trees_created_afterwards() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("rbtrees.tkv"))?;
    let x = store.open_tree("x")?;
    store.put(x, b"a", b"1")?;
    store.commit()?;

    let late = store.open_tree("late")?;
    store.put(late, b"k", b"v")?;
    store.commit()?;

    store.rollback_to(1)?;
    assert!(matches!(
        store.get(late, b"k"),
        Err(StoreError::InvalidArgument(_))
    ));
    // The name is free again; reopening creates a fresh empty tree.
    let reborn = store.open_tree("late")?;
    assert_eq!(store.len(reborn)?, 0);
    // The survivor is untouched.
    assert_eq!(store.get(x, b"a")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn in_memory_versions_roll_back_without_touching_the_file() -> Result<()> {
    let dir = tempdir()?;
    let mut store = open(&dir.path().join("mem.tkv"))?;
    let x = store.open_tree("x")?;
    store.put(x, b"a", b"1")?;
    store.commit()?;

    let v2 = store.increment_version();
    assert_eq!(v2, 2);
    store.put(x, b"b", b"at-v2")?;
    let writes_before = store.file_write_count();

    store.rollback_to(2)?;
    assert_eq!(store.file_write_count(), writes_before);
    assert_eq!(store.current_version(), 2);
    assert_eq!(store.get(x, b"a")?, Some(b"1".to_vec()));
    assert_eq!(store.get(x, b"b")?, None);
    Ok(())
}
