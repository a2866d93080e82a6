//! Range cardinality estimation
//!
//! Samples the root page only. Each root entry contributes the fraction of
//! its box the predicate is expected to select; the mean fraction is
//! scaled by the row count.

use tracing::trace;

use crate::cursor::QueryMode;
use crate::error::{Error, Result};
use crate::mbr::{area, contains, disjoint, intersects, overlap_area, within, Mbr};
use crate::store::LatchMode;
use crate::tree::TreeCore;

/// Estimated number of matching rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEstimate {
    /// Rounded estimate
    Rows(u64),
    /// No usable estimate
    Unknown,
}

fn hit(matched: bool) -> f64 {
    if matched {
        1.0
    } else {
        0.0
    }
}

fn selectivity(mode: QueryMode, entry: &Mbr, query: &Mbr) -> f64 {
    let entry_area = area(entry);
    // zero-area entries either match or they don't
    let point = entry_area == 0.0;
    match mode {
        QueryMode::Contains | QueryMode::Intersects if point => hit(intersects(entry, query, None)),
        QueryMode::Contains | QueryMode::Intersects => overlap_area(entry, query) / entry_area,
        QueryMode::Disjoint if point => hit(disjoint(entry, query, None)),
        QueryMode::Disjoint => 1.0 - overlap_area(entry, query) / entry_area,
        QueryMode::Within if point => hit(within(entry, query, None)),
        QueryMode::Within => overlap_area(entry, query) / entry_area,
        QueryMode::Equal if !contains(entry, query, None) => 0.0,
        QueryMode::Equal if point => 1.0,
        QueryMode::Equal => area(query) / entry_area,
        QueryMode::NearestForInsert | QueryMode::GetExactParent(_) => 0.0,
    }
}

/// Estimate the rows matching `query` out of `total_rows`
pub fn estimate_rows(core: &TreeCore, mode: QueryMode, query: &Mbr, total_rows: u64) -> Result<RowEstimate> {
    if matches!(mode, QueryMode::NearestForInsert | QueryMode::GetExactParent(_)) {
        return Err(Error::InvalidParameter("estimation needs a spatial predicate"));
    }
    query.validate()?;

    let root = core.store.fetch(core.root, LatchMode::Shared)?;
    if root.is_empty() {
        return Ok(RowEstimate::Unknown);
    }
    let mut acc = 0.0;
    for slot in 0..root.len() {
        acc += selectivity(mode, &root.entry_mbr(slot)?, query);
    }
    let entries = root.len();
    drop(root);

    if !acc.is_finite() {
        return Ok(RowEstimate::Unknown);
    }
    let rows = (acc * total_rows as f64 / entries as f64).round();
    trace!(?mode, entries, acc, rows, "root sampled for estimate");
    Ok(RowEstimate::Rows(rows.max(0.0) as u64))
}
