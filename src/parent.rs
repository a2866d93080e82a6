//! Directory entry maintenance
//!
//! Everything here runs under the exclusive tree latch on an exclusively
//! latched [`WritePath`], inside the caller's mutation scope.

use tracing::{debug, error, trace};

use crate::cursor::find_parent_path;
use crate::entry::{IndexEntry, RecordFlags};
use crate::error::{Error, PageId, Result};
use crate::lock::LockMigration;
use crate::mbr::{join, Mbr};
use crate::mtr::MutationScope;
use crate::node_split::split_and_insert;
use crate::path::{latch_path_exclusive, WritePath};
use crate::store::{HeaderUpdate, LatchMode, PageHandle};
use crate::tree::TreeCore;

/// Insert `entry` at `slot`, reorganizing the page if that makes room
///
/// `false` when the entry does not fit even after reorganizing.
pub(crate) fn try_insert_with_reorganize(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    page: &mut PageHandle,
    slot: usize,
    entry: &IndexEntry,
) -> Result<bool> {
    let len = entry.encoded_len();
    if !page.fits(len) {
        if !page.fits_after_reorganize(len) {
            return Ok(false);
        }
        core.store.reorganize(scope, page)?;
    }
    core.store.insert_entry(scope, page, slot, entry, RecordFlags::empty())?;
    Ok(true)
}

/// Keep the min-record marker on slot 0 of leftmost directory pages only
pub(crate) fn fix_min_rec(core: &TreeCore, scope: &mut MutationScope<'_>, page: &mut PageHandle) -> Result<()> {
    if page.is_leaf() {
        return Ok(());
    }
    let leftmost = page.prev().is_none();
    for slot in 0..page.len() {
        let flags = page.record_flags(slot)?;
        let wanted = leftmost && slot == 0;
        if flags.contains(RecordFlags::MIN_REC) != wanted {
            let mut updated = flags - RecordFlags::NODE_PTR;
            updated.set(RecordFlags::MIN_REC, wanted);
            core.store.set_record_flags(scope, page, slot, updated)?;
        }
    }
    Ok(())
}

/// Position of the directory entry for `child` on its parent at `level`
///
/// Walks right from the path's page at `level` when a split moved the
/// entry. If the entry is not found that way the path is released and
/// latched again from the root down to `child`.
pub(crate) fn reseat(
    core: &TreeCore,
    path: &mut WritePath,
    level: u16,
    child: PageId,
    child_mbr: &Mbr,
) -> Result<(usize, usize)> {
    if let Some(pidx) = path.index_of_level(level) {
        loop {
            if let Some(slot) = path.get(pidx).find_child(child)? {
                return Ok((pidx, slot));
            }
            let Some(next) = path.get(pidx).next() else { break };
            trace!(level, from = path.get(pidx).page_id().0, to = next.0, "moving right to find parent entry");
            let page = core.store.fetch(next, LatchMode::Exclusive)?;
            path.replace(pidx, page);
        }
    }

    debug!(child = child.0, level, "parent entry not on the latched path, relatching");
    path.clear();
    let parents = find_parent_path(core, child, level - 1, child_mbr)?;
    *path = latch_path_exclusive(core, &parents, child, level - 1)?;
    let pidx = path.len() - 2;
    match path.get(pidx).find_child(child)? {
        Some(slot) => Ok((pidx, slot)),
        None => Err(Error::corruption("relatched parent lost its child entry", path.get(pidx).page_id())),
    }
}

/// Replace the MBR of the directory entry at `slot` of `path[idx]`
///
/// Rewrites in place for the min-record entry. Otherwise the entry is
/// reinserted at its sorted position, which can split the page in the
/// worst case; the split's top level is returned then.
pub(crate) fn update_mbr_field(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    idx: usize,
    slot: usize,
    mbr: &Mbr,
) -> Result<Option<u16>> {
    let store = &*core.store;
    let page = path.get_mut(idx);
    let flags = page.record_flags(slot)?;
    if flags.contains(RecordFlags::MIN_REC) {
        store.update_mbr_in_place(scope, page, slot, mbr)?;
        return Ok(None);
    }

    let entry = page.entry(slot)?.with_mbr(*mbr);
    if page.len() == 1 {
        if try_insert_with_reorganize(core, scope, page, 1, &entry)? {
            store.delete_entry(scope, page, 0)?;
            return Ok(None);
        }
        store.update_mbr_in_place(scope, page, slot, mbr)?;
        return Ok(None);
    }

    store.delete_entry(scope, page, slot)?;
    let pos = page.insert_position(&entry, core.cmp)?;
    if try_insert_with_reorganize(core, scope, page, pos, &entry)? {
        fix_min_rec(core, scope, page)?;
        return Ok(None);
    }
    let report = split_and_insert(core, scope, path, idx, &entry)?;
    Ok(Some(report.top_level))
}

/// Insert a directory entry right after the one for `after`
///
/// Splits the parent when it is full, returning the split's top level.
pub(crate) fn insert_node_ptr(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    level: u16,
    after: PageId,
    after_mbr: &Mbr,
    entry: &IndexEntry,
) -> Result<Option<u16>> {
    let (pidx, slot) = reseat(core, path, level, after, after_mbr)?;
    if try_insert_with_reorganize(core, scope, path.get_mut(pidx), slot + 1, entry)? {
        fix_min_rec(core, scope, path.get_mut(pidx))?;
        return Ok(None);
    }
    let report = split_and_insert(core, scope, path, pidx, entry)?;
    Ok(Some(report.top_level))
}

/// Grow every ancestor entry on `path` to cover `mbr`
///
/// Returns `true` when an update restructured the tree, which leaves the
/// path unusable for further updates.
pub(crate) fn enlarge_ancestors(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    mbr: &Mbr,
) -> Result<bool> {
    for idx in (0..path.len().saturating_sub(1)).rev() {
        let child = path.get(idx + 1).page_id();
        let page = path.get(idx);
        let Some(slot) = page.find_child(child)? else {
            error!(page_id = page.page_id().0, level = page.level(), child = child.0, "path page lost its child entry");
            return Err(Error::corruption("latched path is not a chain", page.page_id()));
        };
        let current = page.entry_mbr(slot)?;
        let grown = join(&current, mbr);
        if grown == current {
            continue;
        }
        trace!(page_id = page.page_id().0, slot, "enlarging directory entry");
        if update_mbr_field(core, scope, path, idx, slot, &grown)?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Make every ancestor of `leaf` cover `mbr`, relatching from the root
pub(crate) fn cover_entry(core: &TreeCore, scope: &mut MutationScope<'_>, leaf: PageId, mbr: &Mbr) -> Result<()> {
    for _ in 0..=core.config.max_split_retries {
        let parents = find_parent_path(core, leaf, 0, mbr)?;
        let mut path = latch_path_exclusive(core, &parents, leaf, 0)?;
        if !enlarge_ancestors(core, scope, &mut path, mbr)? {
            return Ok(());
        }
    }
    Err(Error::SplitExhausted { page_id: leaf, attempts: core.config.max_split_retries + 1 })
}

/// Recompute the MBRs of `path[idx]` and its ancestors after a removal
///
/// Stops at the first ancestor entry that is already exact.
pub(crate) fn shrink_ancestors(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    idx: usize,
) -> Result<()> {
    for child_idx in (1..=idx).rev() {
        let child = path.get(child_idx);
        let child_id = child.page_id();
        let Some(exact) = child.compute_mbr()? else { break };
        let parent = path.get(child_idx - 1);
        let Some(slot) = parent.find_child(child_id)? else {
            error!(page_id = parent.page_id().0, child = child_id.0, "path page lost its child entry");
            return Err(Error::corruption("latched path is not a chain", parent.page_id()));
        };
        if parent.entry_mbr(slot)? == exact {
            break;
        }
        if update_mbr_field(core, scope, path, child_idx - 1, slot, &exact)?.is_some() {
            break;
        }
    }
    Ok(())
}

/// Fold the parent entries of two merged pages into one
///
/// The entry for `survivor` is rewritten when the union of both entries is
/// wider than it already was, and the entry for `absorbed` is deleted.
/// Returns whether the parent at `pidx` changed; a second call on the same
/// pair finds nothing left to fold.
pub(crate) fn merge_mbrs_and_update(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    pidx: usize,
    survivor: PageId,
    absorbed: PageId,
) -> Result<bool> {
    let parent_id = path.get(pidx).page_id();
    let Some(survivor_slot) = path.get(pidx).find_child(survivor)? else {
        error!(page_id = parent_id.0, survivor = survivor.0, "merge survivor has no parent entry");
        return Err(Error::corruption("merge survivor has no parent entry", parent_id));
    };
    let Some(absorbed_slot) = path.get(pidx).find_child(absorbed)? else {
        return Ok(false);
    };
    let kept = path.get(pidx).entry_mbr(survivor_slot)?;
    let union = join(&kept, &path.get(pidx).entry_mbr(absorbed_slot)?);

    core.store.delete_entry(scope, path.get_mut(pidx), absorbed_slot)?;
    fix_min_rec(core, scope, path.get_mut(pidx))?;
    if union != kept {
        let Some(slot) = path.get(pidx).find_child(survivor)? else {
            return Err(Error::corruption("merge survivor has no parent entry", parent_id));
        };
        trace!(page_id = parent_id.0, slot, "widening merge survivor entry");
        update_mbr_field(core, scope, path, pidx, slot, &union)?;
    }
    Ok(true)
}

/// Unlink and free the empty page at `path[idx]`, then remove its entry
pub(crate) fn discard_page(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    idx: usize,
) -> Result<()> {
    let store = &*core.store;
    let (page_id, prev, next) = {
        let page = path.get(idx);
        (page.page_id(), page.prev(), page.next())
    };
    if let Some(prev_id) = prev {
        let mut left = store.fetch(prev_id, LatchMode::Exclusive)?;
        let before = left.prev();
        store.update_header(scope, &mut left, HeaderUpdate::Links { prev: before, next })?;
    }
    if let Some(next_id) = next {
        let mut right = store.fetch(next_id, LatchMode::Exclusive)?;
        let after = right.next();
        store.update_header(scope, &mut right, HeaderUpdate::Links { prev, next: after })?;
        fix_min_rec(core, scope, &mut right)?;
    }

    scope.defer_lock_migration(LockMigration::Discard { page: page_id });
    if let Some(handle) = path.truncate(idx) {
        store.free_page(scope, handle)?;
    }
    core.stats.page_freed();
    debug!(page_id = page_id.0, "empty page discarded");
    delete_ancestor_pointer(core, scope, path, idx - 1, page_id)
}

/// Remove the entry for `child` from `path[pidx]`, the last page on the path
pub(crate) fn delete_ancestor_pointer(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    pidx: usize,
    child: PageId,
) -> Result<()> {
    let Some(slot) = path.get(pidx).find_child(child)? else {
        error!(page_id = path.get(pidx).page_id().0, child = child.0, "no directory entry for discarded page");
        return Err(Error::corruption("discarded page has no parent entry", path.get(pidx).page_id()));
    };
    core.store.delete_entry(scope, path.get_mut(pidx), slot)?;
    fix_min_rec(core, scope, path.get_mut(pidx))?;

    if pidx == 0 {
        if path.get(0).is_empty() {
            core.store.update_header(scope, path.get_mut(0), HeaderUpdate::Level(0))?;
            return Ok(());
        }
        return lift_root(core, scope, path);
    }
    if path.get(pidx).is_empty() {
        return discard_page(core, scope, path, pidx);
    }
    shrink_ancestors(core, scope, path, pidx)?;
    compress_page(core, scope, path, pidx)
}

/// Merge an underfull `path[idx]` with a sibling under the same parent
///
/// The left page of the pair survives. The parent loses an entry and is
/// compressed in turn. A page no sibling can absorb is compacted by the
/// store instead.
pub(crate) fn compress_page(
    core: &TreeCore,
    scope: &mut MutationScope<'_>,
    path: &mut WritePath,
    idx: usize,
) -> Result<()> {
    if idx == 0 {
        return lift_root(core, scope, path);
    }
    let store = &*core.store;
    let (page_id, prev, next, used, usable, fill) = {
        let page = path.get(idx);
        (page.page_id(), page.prev(), page.next(), page.used_bytes(), page.usable_space(), page.fill_percent())
    };
    if fill >= core.config.merge_threshold_percent {
        return Ok(());
    }

    for (sibling_id, absorb_right) in [(next, true), (prev, false)] {
        let Some(sibling_id) = sibling_id else { continue };
        if path.get(idx - 1).find_child(sibling_id)?.is_none() {
            continue;
        }
        let mut sibling = store.fetch(sibling_id, LatchMode::Exclusive)?;
        if sibling.used_bytes() + used > usable {
            continue;
        }

        let (survivor_id, absorbed_id) = if absorb_right { (page_id, sibling_id) } else { (sibling_id, page_id) };
        let beyond = if absorb_right { sibling.next() } else { next };
        {
            let (survivor, absorbed) = if absorb_right {
                (path.get_mut(idx), &mut sibling)
            } else {
                (&mut sibling, path.get_mut(idx))
            };
            let slots: Vec<usize> = (0..absorbed.len()).collect();
            store.move_records(scope, absorbed, survivor, &slots)?;
            let before = survivor.prev();
            store.update_header(scope, survivor, HeaderUpdate::Links { prev: before, next: beyond })?;
            fix_min_rec(core, scope, survivor)?;
        }
        if let Some(beyond_id) = beyond {
            let mut right = store.fetch(beyond_id, LatchMode::Exclusive)?;
            let after = right.next();
            store.update_header(scope, &mut right, HeaderUpdate::Links { prev: Some(survivor_id), next: after })?;
        }

        scope.defer_lock_migration(LockMigration::Merge { absorbed: absorbed_id, survivor: survivor_id });
        merge_mbrs_and_update(core, scope, path, idx - 1, survivor_id, absorbed_id)?;
        if absorb_right {
            store.free_page(scope, sibling)?;
            path.truncate(idx);
        } else {
            drop(sibling);
            if let Some(handle) = path.truncate(idx) {
                store.free_page(scope, handle)?;
            }
        }
        core.stats.merge();
        core.stats.page_freed();
        debug!(survivor = survivor_id.0, absorbed = absorbed_id.0, "pages merged");

        let pidx = idx - 1;
        if pidx == 0 {
            return lift_root(core, scope, path);
        }
        shrink_ancestors(core, scope, path, pidx)?;
        return compress_page(core, scope, path, pidx);
    }
    if core.store.compress(scope, path.get_mut(idx))? {
        trace!(page_id = page_id.0, "underfull page compacted in place");
    }
    Ok(())
}

/// Pull the only child of the root up into the root page
///
/// Repeats while the root is a directory page with a single entry. The
/// root page id never changes.
pub(crate) fn lift_root(core: &TreeCore, scope: &mut MutationScope<'_>, path: &mut WritePath) -> Result<()> {
    let store = &*core.store;
    path.truncate(1);
    loop {
        let root = path.get(0);
        if root.level() == 0 || root.len() != 1 {
            return Ok(());
        }
        let root_id = root.page_id();
        let Some(child_id) = root.entry(0)?.child() else {
            return Err(Error::corruption("leaf record on a directory root", root_id));
        };
        let child = store.fetch(child_id, LatchMode::Exclusive)?;
        let child_level = child.level();
        let root = path.get_mut(0);
        store.copy_page(scope, root, &child)?;
        store.update_header(scope, root, HeaderUpdate::Level(child_level))?;
        fix_min_rec(core, scope, root)?;

        scope.defer_lock_migration(LockMigration::Merge { absorbed: child_id, survivor: root_id });
        store.free_page(scope, child)?;
        core.stats.root_lift();
        core.stats.page_freed();
        debug!(root = root_id.0, child = child_id.0, level = child_level, "root lifted");
    }
}

/// Restore structure after a record was deleted from the last page on `path`
pub(crate) fn after_leaf_delete(core: &TreeCore, scope: &mut MutationScope<'_>, path: &mut WritePath) -> Result<()> {
    let idx = path.len() - 1;
    if idx == 0 {
        return Ok(());
    }
    if path.get(idx).is_empty() {
        return discard_page(core, scope, path, idx);
    }
    shrink_ancestors(core, scope, path, idx)?;
    compress_page(core, scope, path, idx)
}
