use std::cmp::Ordering;
use std::fs;

use muninn_mirror_lib::meta::{GenIdx, MetaStore};

#[test]
fn missing_file_initialises_counters() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let store = MetaStore::open(dir.path(), 0, false);
    assert_eq!(store.gen(), [1, 1, 1, 1, 0]);
    assert!(MetaStore::file_path(dir.path(), 0).exists());

    // A second open reads the persisted state back.
    let again = MetaStore::open(dir.path(), 0, false);
    assert_eq!(again.gen(), [1, 1, 1, 1, 0]);
    Ok(())
}

#[test]
fn primary_role_is_reflected_on_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let store = MetaStore::open(dir.path(), 1, true);
    assert_eq!(store.gen(), [1, 1, 1, 1, 1]);
    Ok(())
}

#[test]
fn corrupt_file_is_reinitialised() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let path = MetaStore::file_path(dir.path(), 2);
    fs::write(&path, b"garbage that is way off")?;

    let store = MetaStore::open(dir.path(), 2, false);
    assert_eq!(store.gen(), [1, 1, 1, 1, 0]);
    Ok(())
}

#[test]
fn increments_persist() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let store = MetaStore::open(dir.path(), 0, false);
    store.inc(GenIdx::ConnectedCnt, false);
    store.inc(GenIdx::ConnectedCnt, false);
    store.inc(GenIdx::HumanCnt, true);
    drop(store);

    let store = MetaStore::open(dir.path(), 0, false);
    // [Consistent, HumanCnt, ConnectedCnt, ArbitraryCnt, PrimaryInd]; the
    // last write ran with the Primary role.
    assert_eq!(store.gen(), [1, 2, 3, 1, 1]);
    Ok(())
}

#[test]
fn comparison_is_lexicographic() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let store = MetaStore::open(dir.path(), 0, false);
    store.adopt([1, 1, 5, 1, 0], false);

    // Higher connected-count beats a much higher arbitrary-count.
    assert_eq!(store.compare(&[1, 1, 4, 9, 0]), Ordering::Greater);
    assert_eq!(store.compare(&[1, 1, 6, 0, 0]), Ordering::Less);
    assert_eq!(store.compare(&[1, 1, 5, 1, 0]), Ordering::Equal);
    // The consistency flag dominates everything.
    assert_eq!(store.compare(&[0, 9, 9, 9, 1]), Ordering::Greater);
    Ok(())
}

#[test]
fn quick_sync_needs_matching_snapshot() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let store = MetaStore::open(dir.path(), 0, false);
    store.adopt([1, 2, 3, 4, 0], false);
    store.snapshot_bitmap_gen();
    // Events after the snapshot do not disturb the comparison baseline.
    store.inc(GenIdx::ConnectedCnt, false);

    assert!(store.quick_sync_ok(&[1, 2, 3, 4, 0]));
    // Any drifted counter forces a full sync.
    assert!(!store.quick_sync_ok(&[1, 2, 9, 4, 0]));
    // A peer that has been Primary in the meantime forces a full sync.
    assert!(!store.quick_sync_ok(&[1, 2, 3, 4, 1]));
    Ok(())
}

#[test]
fn adoption_rewrites_primary_indicator_from_role(
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let store = MetaStore::open(dir.path(), 0, false);
    // Adopting a Primary's counters as a Secondary keeps our own role flag.
    store.adopt([1, 2, 3, 4, 1], false);
    assert_eq!(store.gen(), [1, 2, 3, 4, 0]);
    Ok(())
}

#[test]
fn consistency_flag_roundtrips() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dir = tempfile::tempdir()?;
    let store = MetaStore::open(dir.path(), 0, false);
    assert!(store.consistent());
    store.set_consistent(false, false);
    assert!(!store.consistent());
    drop(store);

    let store = MetaStore::open(dir.path(), 0, false);
    assert!(!store.consistent());
    store.set_consistent(true, false);
    store.set_consistent(true, false);
    assert!(store.consistent());
    Ok(())
}
