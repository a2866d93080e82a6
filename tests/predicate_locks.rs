//! Predicate locks placed by scans and carried through splits

mod common;

use std::sync::Arc;

use common::{row, unit};
use zerodb_rtree::{Error, Mbr, PredicateLockTable, PredicateMode, QueryMode, Result, TransactionId, TreeBuilder};

const SCANNER: TransactionId = TransactionId(10);
const WRITER: TransactionId = TransactionId(20);

#[test]
fn test_scan_lock_follows_split_pages() -> Result<()> {
    let locks = Arc::new(PredicateLockTable::new());
    let tree = TreeBuilder::new().page_size(512).lock_coordinator(locks.clone()).in_memory()?;
    tree.insert(SCANNER, unit(0), row(0))?;

    let region = Mbr::rect(0.0, 0.0, 1000.0, 1.0);
    assert_eq!(tree.search_locked(SCANNER, QueryMode::Intersects, &region)?.len(), 1);
    assert_eq!(locks.locks_on(tree.root()).len(), 1);

    // the scanner's own inserts never conflict with its scan lock
    for i in 1..200 {
        tree.insert(SCANNER, unit(i), row(i))?;
    }
    assert!(tree.stats().root_raises >= 1);
    assert!(locks.locks_on(tree.root()).is_empty(), "scan lock stayed on the raised root");
    assert!(locks.len() > 1, "split siblings did not inherit the scan lock");

    // every leaf under the region is now covered
    for column in [3, 77, 150, 198] {
        let err = tree.insert(WRITER, unit(column), row(10_000 + column)).unwrap_err();
        assert!(
            matches!(err, Error::LockConflict { holder: SCANNER, requester: WRITER, .. }),
            "{err:?}"
        );
    }
    assert_eq!(tree.len(), 200);

    locks.release_all(SCANNER);
    assert!(locks.is_empty());
    tree.insert(WRITER, unit(77), row(10_077))?;
    assert_eq!(tree.len(), 201);
    Ok(())
}

#[test]
fn test_delete_takes_exclusive_lock() -> Result<()> {
    let locks = Arc::new(PredicateLockTable::new());
    let tree = TreeBuilder::new().page_size(512).lock_coordinator(locks.clone()).in_memory()?;
    for i in 0..5 {
        tree.insert(WRITER, unit(i), row(i))?;
    }
    tree.search_locked(SCANNER, QueryMode::Within, &Mbr::rect(0.0, 0.0, 2.0, 1.0))?;

    let err = tree.delete(WRITER, &unit(1), &row(1)).unwrap_err();
    assert!(matches!(err, Error::LockConflict { .. }), "{err:?}");
    assert_eq!(tree.len(), 5);

    // outside the scanned window
    assert!(tree.delete(WRITER, &unit(4), &row(4))?);
    let held = locks.locks_on(tree.root());
    assert!(held.iter().any(|l| l.owner == WRITER && l.mode == PredicateMode::Exclusive));

    // readers now conflict with the writer's exclusive lock
    let err = tree.search_locked(SCANNER, QueryMode::Intersects, &unit(4)).unwrap_err();
    assert!(matches!(err, Error::LockConflict { holder: WRITER, .. }), "{err:?}");
    Ok(())
}

#[test]
fn test_failed_split_keeps_scan_lock() -> Result<()> {
    let locks = Arc::new(PredicateLockTable::new());
    // room for the root and one more page only
    let tree = TreeBuilder::new()
        .page_size(512)
        .max_pages(2)
        .lock_coordinator(locks.clone())
        .in_memory()?;
    for i in 0..9 {
        tree.insert(WRITER, unit(i), row(i))?;
    }
    let region = Mbr::rect(0.0, 0.0, 5.0, 1.0);
    assert!(tree.search_locked(SCANNER, QueryMode::Intersects, &region)?.len() >= 5);
    assert_eq!(locks.locks_on(tree.root()).len(), 1);

    // outside the scanned region, so the insert gets as far as raising the root
    let err = tree.insert(WRITER, unit(9), row(9)).unwrap_err();
    assert!(matches!(err, Error::MapFull { .. }), "{err:?}");

    let held = locks.locks_on(tree.root());
    assert_eq!(held.len(), 1, "scan lock left the root of a rolled back split");
    assert_eq!(held[0].owner, SCANNER);
    assert_eq!(locks.len(), 1);

    let err = tree.delete(WRITER, &unit(2), &row(2)).unwrap_err();
    assert!(matches!(err, Error::LockConflict { holder: SCANNER, requester: WRITER, .. }), "{err:?}");
    assert_eq!(tree.len(), 9);
    assert_eq!(tree.validate()?.pages, 1);

    locks.release_all(SCANNER);
    assert!(tree.delete(WRITER, &unit(2), &row(2))?);
    Ok(())
}
