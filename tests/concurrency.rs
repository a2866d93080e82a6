//! Readers scanning while a writer splits or merges pages underneath them

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use std::collections::HashSet;

use common::{init_tracing, row, row_id, unique_ids, unit, TXN};
use zerodb_rtree::path::restore_position;
use zerodb_rtree::{LatchMode, Match, Mbr, MemPageStore, QueryMode, Result, TransactionId, TreeBuilder};

fn cell(i: u64) -> Mbr {
    let x = (i % 64) as f64 * 2.0;
    let y = (i / 64) as f64 * 2.0;
    Mbr::rect(x, y, x + 1.0, y + 1.0)
}

const EVERYTHING: Mbr = Mbr::rect(-1.0, -1.0, 1.0e6, 1.0e6);

#[test]
fn test_readers_see_committed_rows_during_splits() -> Result<()> {
    init_tracing();
    const ROWS: u64 = 3000;
    const READERS: usize = 4;

    let tree = Arc::new(TreeBuilder::new().page_size(1024).in_memory()?);
    let committed = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(READERS + 1));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let tree = tree.clone();
            let committed = committed.clone();
            let done = done.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> Result<u64> {
                barrier.wait();
                let mut scans = 0;
                while !done.load(Ordering::Acquire) {
                    let floor = committed.load(Ordering::Acquire);
                    let found = tree.search(QueryMode::Intersects, &EVERYTHING)?;
                    let ids = unique_ids(&found);
                    assert!((0..floor).all(|i| ids.contains(&i)), "scan missed a row below {floor}");
                    scans += 1;
                }
                Ok(scans)
            })
        })
        .collect();

    barrier.wait();
    for i in 0..ROWS {
        tree.insert(TXN, cell(i), row(i))?;
        committed.store(i + 1, Ordering::Release);
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().expect("reader panicked")?;
    }

    let shape = tree.validate()?;
    assert_eq!(shape.entries, ROWS);
    assert!(tree.stats().leaf_splits > 0);
    Ok(())
}

#[test]
fn test_writers_are_serialized() -> Result<()> {
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 250;

    let tree = Arc::new(TreeBuilder::new().page_size(512).in_memory()?);
    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let tree = tree.clone();
            thread::spawn(move || -> Result<()> {
                for n in 0..PER_WRITER {
                    let i = w * PER_WRITER + n;
                    tree.insert(TransactionId(w + 1), cell(i), row(i))?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    assert_eq!(tree.len(), WRITERS * PER_WRITER);
    assert_eq!(tree.validate()?.entries, WRITERS * PER_WRITER);
    let ids = unique_ids(&tree.search(QueryMode::Intersects, &EVERYTHING)?);
    assert_eq!(ids.len() as u64, WRITERS * PER_WRITER);
    Ok(())
}

#[test]
fn test_cursor_survives_concurrent_splits() -> Result<()> {
    let tree = Arc::new(TreeBuilder::new().page_size(512).in_memory()?);
    for i in 0..200 {
        tree.insert(TXN, cell(i), row(i))?;
    }

    let writer = {
        let tree = tree.clone();
        thread::spawn(move || -> Result<()> {
            for i in 200..1200 {
                tree.insert(TXN, cell(i), row(i))?;
            }
            Ok(())
        })
    };

    // slow scan interleaved with the writer
    let mut seen = Vec::new();
    for found in tree.cursor(QueryMode::Intersects, EVERYTHING)? {
        seen.push(row_id(found?.entry()));
        thread::yield_now();
    }
    writer.join().expect("writer panicked")?;

    let mut sorted = seen.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), seen.len(), "cursor returned a row twice");
    assert!((0..200).all(|i| sorted.binary_search(&i).is_ok()));
    tree.validate()?;
    Ok(())
}

#[test]
fn test_readers_during_merges_and_root_lifts() -> Result<()> {
    init_tracing();
    const ROWS: u64 = 2000;
    const READERS: usize = 4;

    let store = Arc::new(MemPageStore::new(512)?);
    let tree = Arc::new(TreeBuilder::new().page_size(512).create(store.clone())?);
    for i in 0..ROWS {
        tree.insert(TXN, cell(i), row(i))?;
    }
    let height = tree.validate()?.height;
    assert!(height >= 3, "tree only {height} levels high");

    let kept: HashSet<u64> = (0..ROWS).filter(|i| i % 97 == 0).collect();
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(READERS + 1));

    // rows may move left past a reader during a merge, so only the
    // returned ids are checked here
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let tree = tree.clone();
            let done = done.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> Result<u64> {
                barrier.wait();
                let mut scans = 0;
                while !done.load(Ordering::Acquire) {
                    for entry in tree.search(QueryMode::Intersects, &EVERYTHING)? {
                        let id = row_id(&entry);
                        assert!(id < ROWS, "scan returned unknown row {id}");
                    }
                    scans += 1;
                }
                Ok(scans)
            })
        })
        .collect();

    barrier.wait();
    for i in (0..ROWS).filter(|i| !kept.contains(i)) {
        assert!(tree.delete(TXN, &cell(i), &row(i))?, "row {i} not deleted");
    }
    let left = unique_ids(&tree.search(QueryMode::Intersects, &EVERYTHING)?);
    assert_eq!(left, kept);

    // emptying the tree collapses every directory level into the root
    for &i in &kept {
        assert!(tree.delete(TXN, &cell(i), &row(i))?);
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().expect("reader panicked")?;
    }

    let stats = tree.stats();
    assert!(stats.merges > 0);
    assert!(stats.pages_freed > 0);
    assert!(stats.root_lifts > 0);
    assert_eq!(tree.len(), 0);
    assert_eq!(tree.validate()?.pages, 1);
    assert_eq!(store.reader_count(), 0);

    // ids held back for the readers are handed out again once they are gone
    assert!(store.free_count() > 0);
    for i in 0..100 {
        tree.insert(TXN, cell(i), row(i))?;
    }
    assert_eq!(store.pending_count(), 0);
    assert_eq!(tree.validate()?.entries, 100);
    Ok(())
}

#[test]
fn test_saved_positions_follow_split_siblings() -> Result<()> {
    let tree = TreeBuilder::new().page_size(512).in_memory()?;
    for i in 0..30 {
        tree.insert(TXN, unit(i), row(i))?;
    }

    // save every position on the page of the newest row, then insert next to
    // it until that page splits
    let mut next = 30;
    let saved = loop {
        let found: Vec<Match> = tree.cursor(QueryMode::Intersects, EVERYTHING)?.collect::<Result<_>>()?;
        let page = found
            .iter()
            .find(|m| row_id(m.entry()) == next - 1)
            .map(Match::page_id)
            .expect("newest row visible");
        let positions: Vec<_> = found.into_iter().filter(|m| m.page_id() == page).map(|m| m.saved).collect();

        let splits = tree.stats().leaf_splits;
        tree.insert(TXN, unit(next), row(next))?;
        next += 1;
        if tree.stats().leaf_splits > splits {
            break positions;
        }
        assert!(next < 100, "leaf never split");
    };

    let fallbacks = tree.stats().restore_fallbacks;
    let mut moved = 0;
    for position in &saved {
        let (page, slot) = restore_position(tree.core(), position, LatchMode::Shared)?;
        assert_eq!(page.entry(slot)?, position.record);
        if page.page_id() != position.page_id {
            moved += 1;
        }
    }
    assert!(moved > 0, "no saved record was found on the split sibling");
    assert!(moved < saved.len(), "every saved record left its page");
    assert!(tree.stats().restore_fallbacks > fallbacks);
    tree.validate()?;
    Ok(())
}
