//! Node split orchestration
//!
//! Splits the page at a position of an exclusively latched path and places
//! a pending entry. The original page keeps the first group and takes a
//! fresh SSN; the new right sibling takes the second group and inherits
//! the old SSN, so a reader that queued the page before the split sees a
//! larger SSN and follows the right link. The parent stays latched until
//! the sibling's entry is in it.

use tracing::{debug, error, warn};

use crate::cursor::find_parent_path;
use crate::entry::{IndexEntry, RecordFlags};
use crate::error::{Error, PageId, Result};
use crate::lock::LockMigration;
use crate::mbr::Mbr;
use crate::mtr::MutationScope;
use crate::page::SLOT_SIZE;
use crate::parent::{fix_min_rec, insert_node_ptr, reseat, try_insert_with_reorganize, update_mbr_field};
use crate::path::{latch_path_exclusive, WritePath};
use crate::split::{min_split_bytes, split_entries, Group, SplitGroups, SplitInput};
use crate::store::{HeaderUpdate, LatchMode, PageHandle};
use crate::tree::TreeCore;

/// Where a split placed its pending entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SplitReport {
    /// Highest level that split
    pub top_level: u16,
    /// Page holding the pending entry
    pub placed_on: PageId,
}

/// Result of one split attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SplitOutcome {
    /// The pending entry was placed
    Inserted(SplitReport),
    /// The split completed but the pending entry did not fit in its group
    RetryAtPage {
        /// Page that should take the entry
        page_id: PageId,
        /// Its level
        level: u16,
        /// Bytes used on it
        occupancy: usize,
    },
}

/// Split `path[idx]` and place `entry`, retrying a bounded number of times
///
/// Each retry must find the target page strictly less occupied than the
/// previous one.
pub(crate) fn split_and_insert(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    idx: usize,
    entry: &IndexEntry,
) -> Result<SplitReport> {
    let mut idx = idx;
    let mut last_occupancy = usize::MAX;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match split_once(core, scope, path, idx, entry)? {
            SplitOutcome::Inserted(report) => return Ok(report),
            SplitOutcome::RetryAtPage { page_id, level, occupancy } => {
                core.stats.split_retry();
                if occupancy >= last_occupancy || attempts > core.config.max_split_retries {
                    error!(page_id = page_id.0, level, occupancy, attempts, "split did not converge");
                    return Err(Error::SplitExhausted { page_id, attempts });
                }
                warn!(page_id = page_id.0, level, occupancy, attempts, "entry did not fit after split, splitting again");
                last_occupancy = occupancy;

                path.clear();
                let mbr = {
                    let page = core.store.fetch(page_id, LatchMode::Shared)?;
                    page.compute_mbr()?.unwrap_or(*entry.mbr())
                };
                let parents = find_parent_path(core, page_id, level, &mbr)?;
                *path = latch_path_exclusive(core, &parents, page_id, level)?;
                idx = path.len() - 1;
            }
        }
    }
}

fn split_once(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    idx: usize,
    entry: &IndexEntry,
) -> Result<SplitOutcome> {
    let store = &*core.store;
    let mut idx = idx;
    if idx == 0 {
        raise_root(core, scope, path)?;
        idx = 1;
    }

    let (page_id, level, n) = {
        let page = path.get(idx);
        (page.page_id(), page.level(), page.len())
    };
    if n == 0 {
        error!(page_id = page_id.0, level, record = ?entry, "entry does not fit on an empty page");
        return Err(Error::corruption("split of an empty page", page_id));
    }
    let groups = plan_split(core, path.get(idx), entry)?;
    let moving: Vec<usize> = groups.members(Group::Second).filter(|&i| i < n).collect();

    let mut sibling = store.alloc_page(scope, Some(page_id), level)?;
    let sibling_id = sibling.page_id();
    let old_ssn = path.get(idx).ssn();
    let new_ssn = core.ssn.next_ssn();
    store.update_header(scope, path.get_mut(idx), HeaderUpdate::Ssn(new_ssn))?;
    store.update_header(scope, &mut sibling, HeaderUpdate::Ssn(old_ssn))?;

    match store.move_records(scope, path.get_mut(idx), &mut sibling, &moving) {
        Ok(()) => {}
        Err(Error::PageFull { .. }) => {
            debug!(page_id = page_id.0, "record move failed, splitting from a page copy");
            copy_then_trim(core, scope, path.get_mut(idx), &mut sibling, &groups, n)?;
        }
        Err(e) => return Err(e),
    }

    let (prev, old_next) = {
        let page = path.get(idx);
        (page.prev(), page.next())
    };
    store.update_header(scope, &mut sibling, HeaderUpdate::Links { prev: Some(page_id), next: old_next })?;
    store.update_header(scope, path.get_mut(idx), HeaderUpdate::Links { prev, next: Some(sibling_id) })?;
    if let Some(next_id) = old_next {
        let mut neighbour = store.fetch(next_id, LatchMode::Exclusive)?;
        let after = neighbour.next();
        store.update_header(scope, &mut neighbour, HeaderUpdate::Links { prev: Some(sibling_id), next: after })?;
    }
    fix_min_rec(core, scope, path.get_mut(idx))?;
    fix_min_rec(core, scope, &mut sibling)?;

    let (placed, target_id, occupancy) = {
        let (target, target_id) = match groups.group_of(n) {
            Group::First => (path.get_mut(idx), page_id),
            Group::Second => (&mut sibling, sibling_id),
        };
        let pos = target.insert_position(entry, core.cmp)?;
        let placed = try_insert_with_reorganize(core, scope, target, pos, entry)?;
        if placed {
            fix_min_rec(core, scope, target)?;
        }
        (placed, target_id, target.used_bytes())
    };

    let page_mbr = path
        .get(idx)
        .compute_mbr()?
        .ok_or_else(|| Error::corruption("split left a page empty", page_id))?;
    let sibling_mbr = sibling
        .compute_mbr()?
        .ok_or_else(|| Error::corruption("split left a page empty", sibling_id))?;
    scope.defer_lock_migration(LockMigration::Split {
        old: page_id,
        new: sibling_id,
        old_mbr: page_mbr,
        new_mbr: sibling_mbr,
    });
    drop(sibling);

    if level == 0 {
        core.stats.leaf_split();
    } else {
        core.stats.branch_split();
    }
    debug!(
        page_id = page_id.0,
        sibling = sibling_id.0,
        level,
        moved = moving.len(),
        ssn = new_ssn,
        "page split"
    );

    let mut top_level = level;
    let (pidx, slot) = reseat(core, path, level + 1, page_id, &page_mbr)?;
    if let Some(top) = update_mbr_field(core, scope, path, pidx, slot, &page_mbr)? {
        top_level = top_level.max(top);
    }
    let pointer = IndexEntry::node_ptr(sibling_mbr, sibling_id);
    if let Some(top) = insert_node_ptr(core, scope, path, level + 1, page_id, &page_mbr, &pointer)? {
        top_level = top_level.max(top);
    }
    persist_tree_ssn(core, scope, path)?;

    if placed {
        Ok(SplitOutcome::Inserted(SplitReport { top_level, placed_on: target_id }))
    } else {
        Ok(SplitOutcome::RetryAtPage { page_id: target_id, level, occupancy })
    }
}

/// Group the page's records and the pending entry
fn plan_split(core: &TreeCore, page: &PageHandle, entry: &IndexEntry) -> Result<SplitGroups> {
    let mut items = Vec::with_capacity(page.len() + 1);
    for slot in 0..page.len() {
        items.push(SplitInput { mbr: page.entry_mbr(slot)?, bytes: page.record(slot)?.len() + SLOT_SIZE });
    }
    items.push(SplitInput { mbr: *entry.mbr(), bytes: entry.encoded_len() + SLOT_SIZE });

    let total: usize = items.iter().map(|i| i.bytes).sum();
    let max_item = items.iter().map(|i| i.bytes).max().unwrap_or(0);
    let min_bytes = min_split_bytes(page.usable_space(), core.config.min_fill_percent, total, max_item);
    split_entries(&items, min_bytes)
}

/// Give `sibling` a copy of `page` and delete the other group on each side
fn copy_then_trim(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    page: &mut PageHandle,
    sibling: &mut PageHandle,
    groups: &SplitGroups,
    n: usize,
) -> Result<()> {
    let store = &*core.store;
    store.copy_page(scope, sibling, &**page)?;
    for slot in (0..n).rev() {
        match groups.group_of(slot) {
            Group::First => store.delete_entry(scope, sibling, slot)?,
            Group::Second => store.delete_entry(scope, page, slot)?,
        }
    }
    Ok(())
}

/// Move the root's records to a new child so the root can split
///
/// The root keeps its page id and goes up one level with a single entry.
fn raise_root(core: &TreeCore, scope: &mut MutationScope<'_>, path: &mut WritePath) -> Result<()> {
    let store = &*core.store;
    let (root_id, level, ssn) = {
        let root = path.get(0);
        (root.page_id(), root.level(), root.ssn())
    };
    let mut child = store.alloc_page(scope, Some(root_id), level)?;
    store.copy_page(scope, &mut child, path.get(0))?;
    store.update_header(scope, &mut child, HeaderUpdate::Ssn(ssn))?;
    let child_mbr: Mbr = child
        .compute_mbr()?
        .ok_or_else(|| Error::corruption("raising an empty root", root_id))?;

    let root = path.get_mut(0);
    store.clear_page(scope, root)?;
    store.update_header(scope, root, HeaderUpdate::Level(level + 1))?;
    store.insert_entry(scope, root, 0, &IndexEntry::node_ptr(child_mbr, child.page_id()), RecordFlags::MIN_REC)?;

    // the records now live on the child, and so do their scan locks
    scope.defer_lock_migration(LockMigration::Merge { absorbed: root_id, survivor: child.page_id() });
    core.stats.root_raise();
    debug!(root = root_id.0, child = child.page_id().0, level = level + 1, "root raised");
    path.insert(1, child);
    Ok(())
}

/// Write the current SSN into the root header
fn persist_tree_ssn(core: &TreeCore, scope: &mut MutationScope<'_>, path: &mut WritePath) -> Result<()> {
    let current = core.ssn.current_ssn();
    match path.position(core.root) {
        Some(idx) => core.store.update_header(scope, path.get_mut(idx), HeaderUpdate::TreeSsn(current)),
        None => {
            let mut root = core.store.fetch(core.root, LatchMode::Exclusive)?;
            core.store.update_header(scope, &mut root, HeaderUpdate::TreeSsn(current))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeBuilder;
    use crate::error::TransactionId;
    use crate::page::max_entry_len;

    fn unit(i: u64) -> Mbr {
        Mbr::rect(i as f64, 0.0, i as f64 + 1.0, 1.0)
    }

    #[test]
    fn test_leaf_split_assigns_ssns() {
        let tree = TreeBuilder::new().page_size(512).in_memory().unwrap();
        for i in 0..9u64 {
            tree.insert(TransactionId(1), unit(i), i.to_be_bytes()).unwrap();
        }
        assert_eq!(tree.stats().leaf_splits, 0);
        let before = tree.current_ssn();

        tree.insert(TransactionId(1), unit(9), 9u64.to_be_bytes()).unwrap();
        let stats = tree.stats();
        assert_eq!(stats.leaf_splits, 1);
        assert_eq!(stats.root_raises, 1);
        assert_eq!(tree.current_ssn(), before + 1);

        let core = tree.core();
        let root = core.store.fetch(core.root, LatchMode::Shared).unwrap();
        assert_eq!(root.level(), 1);
        assert_eq!(root.len(), 2);
        assert_eq!(root.tree_ssn(), tree.current_ssn());
        let left = root.entry(0).unwrap().child().unwrap();
        let right = root.entry(1).unwrap().child().unwrap();
        drop(root);

        let left = core.store.fetch(left, LatchMode::Shared).unwrap();
        let right = core.store.fetch(right, LatchMode::Shared).unwrap();
        // the page that split carries the new SSN, its sibling the old one
        let (split, sib) = if left.next() == Some(right.page_id()) { (&left, &right) } else { (&right, &left) };
        assert_eq!(split.ssn(), before + 1);
        assert_eq!(sib.ssn(), before);
        assert_eq!(sib.prev(), Some(split.page_id()));
        assert_eq!(left.len() + right.len(), 10);
        drop(left);
        drop(right);
        tree.validate().unwrap();
    }

    #[test]
    fn test_split_cascades_to_directory() {
        let tree = TreeBuilder::new().page_size(512).in_memory().unwrap();
        for i in 0..200u64 {
            tree.insert(TransactionId(1), unit(i), i.to_be_bytes()).unwrap();
        }
        let stats = tree.stats();
        assert!(stats.branch_splits > 0);
        assert!(stats.root_raises >= 2);
        let shape = tree.validate().unwrap();
        assert_eq!(shape.entries, 200);
        assert!(shape.height >= 3);
    }

    #[test]
    fn test_failed_split_rolls_back() {
        // room for the root and one more page only
        let tree = TreeBuilder::new().page_size(512).max_pages(2).in_memory().unwrap();
        for i in 0..9u64 {
            tree.insert(TransactionId(1), unit(i), i.to_be_bytes()).unwrap();
        }
        let err = tree.insert(TransactionId(1), unit(9), 9u64.to_be_bytes()).unwrap_err();
        assert!(matches!(err, Error::MapFull { .. }));

        let shape = tree.validate().unwrap();
        assert_eq!(shape.pages, 1);
        assert_eq!(shape.entries, 9);
        assert_eq!(tree.len(), 9);
        assert_eq!(tree.search(crate::cursor::QueryMode::Intersects, &Mbr::rect(0.0, 0.0, 100.0, 1.0)).unwrap().len(), 9);
    }

    #[test]
    fn test_large_entries_split() {
        let tree = TreeBuilder::new().page_size(512).in_memory().unwrap();
        let payload_len = max_entry_len(512) - crate::entry::RECORD_HEADER_SIZE;
        for i in 0..40u64 {
            let mut payload = vec![0u8; payload_len];
            payload[..8].copy_from_slice(&i.to_be_bytes());
            tree.insert(TransactionId(1), unit(i % 7), payload).unwrap();
        }
        let shape = tree.validate().unwrap();
        assert_eq!(shape.entries, 40);
        assert_eq!(tree.stats().split_retries, 0);
    }
}
