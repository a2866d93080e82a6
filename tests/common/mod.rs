//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::HashSet;

use tracing_subscriber::EnvFilter;
use zerodb_rtree::{IndexEntry, Mbr, RTree, Result, TransactionId, TreeBuilder};

/// Transaction used by tests that don't care about locking
pub const TXN: TransactionId = TransactionId(1);

/// Log to the test output when `RUST_LOG` is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Unit square at column `i`
pub fn unit(i: u64) -> Mbr {
    Mbr::rect(i as f64, 0.0, i as f64 + 1.0, 1.0)
}

/// Row locator for row `i`
pub fn row(i: u64) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

/// Decode the row id leading a locator written by [`row`]
pub fn row_id(entry: &IndexEntry) -> u64 {
    let payload = entry.payload().expect("leaf entry");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&payload[..8]);
    u64::from_be_bytes(buf)
}

/// In-memory tree with `n` unit squares side by side
pub fn filled_tree(page_size: usize, n: u64) -> Result<RTree> {
    let tree = TreeBuilder::new().page_size(page_size).in_memory()?;
    for i in 0..n {
        tree.insert(TXN, unit(i), row(i))?;
    }
    Ok(tree)
}

/// Row ids of `entries`, panicking on duplicates
pub fn unique_ids(entries: &[IndexEntry]) -> HashSet<u64> {
    let mut ids = HashSet::with_capacity(entries.len());
    for entry in entries {
        let id = row_id(entry);
        assert!(ids.insert(id), "row {id} returned twice");
    }
    ids
}
