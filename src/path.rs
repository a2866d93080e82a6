//! Per-operation traversal state
//!
//! Paths hold page ids and saved slot positions, never live references.
//! A saved position is re-validated against the page's modify clock before
//! use and relocated by record content when the page has changed.

use tracing::{debug, error};

use crate::entry::IndexEntry;
use crate::error::{Error, PageId, Result};
use crate::mbr::{join, Mbr};
use crate::page::Page;
use crate::ssn::Ssn;
use crate::store::{LatchMode, PageHandle};
use crate::tree::TreeCore;

/// A page queued for visiting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchPathEntry {
    /// Page to visit
    pub page_id: PageId,
    /// Tree SSN when the page was queued
    pub ssn_at_visit: Ssn,
    /// Expected level, unknown for the root
    pub level: Option<u16>,
    /// Page the queueing directory entry references; differs from
    /// `page_id` only for a sibling queued by SSN correction
    pub child_page_id: Option<PageId>,
    /// Index of the directory entry that queued this page in the
    /// cursor's parent arena
    pub parent_cursor: Option<usize>,
}

/// A directory entry traversed by a write
#[derive(Debug, Clone, PartialEq)]
pub struct ParentPathEntry {
    /// Level of the page holding the entry
    pub level: u16,
    /// Page holding the entry
    pub page_id: PageId,
    /// Child the entry points at
    pub child_page_id: PageId,
    /// Area growth the entry needs to cover the write
    pub mbr_increase: f64,
    /// Position of the entry
    pub saved_cursor: SavedCursor,
    /// Arena index of the entry above this one
    pub up: Option<usize>,
}

impl ParentPathEntry {
    /// Whether the entry's MBR must grow to cover `mbr`
    pub fn needs_enlarge(&self, mbr: &Mbr) -> bool {
        let current = self.saved_cursor.record.mbr();
        join(current, mbr) != *current
    }
}

/// Saved position of a record
#[derive(Debug, Clone, PartialEq)]
pub struct SavedCursor {
    /// Page the record was on
    pub page_id: PageId,
    /// Slot the record was in
    pub slot: usize,
    /// Page modify clock at save time
    pub modify_clock: u64,
    /// Page SSN at save time
    pub ssn: Ssn,
    /// The record itself
    pub record: IndexEntry,
}

impl SavedCursor {
    /// Save the position of `slot` on `page`
    pub fn capture(page: &Page, slot: usize, record: IndexEntry) -> Self {
        Self { page_id: page.page_id(), slot, modify_clock: page.modify_clock(), ssn: page.ssn(), record }
    }

    /// Slot of the saved record on `page`, if it is there
    ///
    /// An unchanged modify clock proves the slot is still valid; otherwise
    /// the record is searched for by content.
    pub fn revalidate(&self, page: &Page) -> Result<Option<usize>> {
        if page.page_id() == self.page_id && page.modify_clock() == self.modify_clock {
            return Ok(Some(self.slot));
        }
        match self.record.child() {
            Some(child) => page.find_child(child),
            None => page.find_entry(&self.record),
        }
    }
}

/// Latch the page of a saved position and find the record again
///
/// Follows right siblings while the page's SSN shows it split after the
/// position was saved. A page that no longer exists is corruption.
pub fn restore_position(core: &TreeCore, saved: &SavedCursor, mode: LatchMode) -> Result<(PageHandle, usize)> {
    let mut page_id = saved.page_id;
    loop {
        let page = match core.store.fetch(page_id, mode) {
            Ok(page) => page,
            Err(Error::PageNotFound(id)) => {
                error!(page_id = id.0, saved_page = saved.page_id.0, record = ?saved.record, "saved cursor page was freed");
                return Err(Error::corruption("page of a saved cursor no longer exists", id));
            }
            Err(e) => return Err(e),
        };
        if page_id != saved.page_id || page.modify_clock() != saved.modify_clock {
            core.stats.restore_fallback();
            debug!(page_id = page_id.0, slot = saved.slot, "optimistic restore failed, relocating record");
        }
        if let Some(slot) = saved.revalidate(&page)? {
            return Ok((page, slot));
        }
        match page.next() {
            Some(next) if page.ssn() > saved.ssn => page_id = next,
            _ => {
                error!(page_id = page_id.0, level = page.level(), record = ?saved.record, "saved record not found");
                return Err(Error::corruption("saved record not found after restore", page_id));
            }
        }
    }
}

/// Exclusively latched pages from the root down
pub struct WritePath {
    pages: Vec<PageHandle>,
}

impl WritePath {
    /// Empty path
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Number of latched pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether no page is latched
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Append the next page down
    pub fn push(&mut self, page: PageHandle) {
        self.pages.push(page);
    }

    /// Insert a page at `idx`
    pub fn insert(&mut self, idx: usize, page: PageHandle) {
        self.pages.insert(idx, page);
    }

    /// Page at `idx`
    pub fn get(&self, idx: usize) -> &PageHandle {
        &self.pages[idx]
    }

    /// Page at `idx`, mutably
    pub fn get_mut(&mut self, idx: usize) -> &mut PageHandle {
        &mut self.pages[idx]
    }

    /// Replace the page at `idx`, returning the old handle
    pub fn replace(&mut self, idx: usize, page: PageHandle) -> PageHandle {
        std::mem::replace(&mut self.pages[idx], page)
    }

    /// Index of the page at `level`
    pub fn index_of_level(&self, level: u16) -> Option<usize> {
        self.pages.iter().position(|p| p.level() == level)
    }

    /// Index of page `page_id`
    pub fn position(&self, page_id: PageId) -> Option<usize> {
        self.pages.iter().position(|p| p.page_id() == page_id)
    }

    /// Release every page from `idx` down, returning the one at `idx`
    pub fn truncate(&mut self, idx: usize) -> Option<PageHandle> {
        if idx >= self.pages.len() {
            return None;
        }
        let mut tail = self.pages.split_off(idx);
        tail.truncate(1);
        tail.pop()
    }

    /// Release every page
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

impl Default for WritePath {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusively latch a recorded parent path and its target, root first
pub fn latch_path_exclusive(
    core: &TreeCore,
    parents: &[ParentPathEntry],
    target: PageId,
    level: u16,
) -> Result<WritePath> {
    let mut path = WritePath::new();
    if parents.is_empty() && target != core.root {
        return Err(Error::corruption("non-root page without a parent path", target));
    }
    for (i, parent) in parents.iter().enumerate() {
        let (page, slot) = restore_position(core, &parent.saved_cursor, LatchMode::Exclusive)?;
        let child = page.entry(slot)?.child();
        if child != Some(parent.child_page_id) {
            error!(
                page_id = page.page_id().0,
                level = page.level(),
                slot,
                expected = parent.child_page_id.0,
                found = ?child,
                "directory entry does not reference the recorded child"
            );
            return Err(Error::corruption("parent path entry points at a different child", page.page_id()));
        }
        let expected_prev = if i == 0 { None } else { Some(parents[i - 1].child_page_id) };
        if expected_prev.is_some_and(|id| id != page.page_id()) {
            return Err(Error::corruption("parent path is not a chain", page.page_id()));
        }
        path.push(page);
    }
    let page = core.store.fetch(target, LatchMode::Exclusive)?;
    if page.level() != level {
        error!(page_id = target.0, expected = level, found = page.level(), "target page level mismatch");
        return Err(Error::corruption("target page has an unexpected level", target));
    }
    path.push(page);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::RecordFlags;

    #[test]
    fn test_saved_cursor_revalidate() {
        let mut page = Page::new(PageId(4), 1, 1024);
        let a = IndexEntry::node_ptr(Mbr::rect(0.0, 0.0, 1.0, 1.0), PageId(10));
        let b = IndexEntry::node_ptr(Mbr::rect(2.0, 0.0, 3.0, 1.0), PageId(11));
        page.insert_entry(0, &a, RecordFlags::empty()).unwrap();
        page.insert_entry(1, &b, RecordFlags::empty()).unwrap();

        let saved = SavedCursor::capture(&page, 1, b.clone());
        assert_eq!(saved.revalidate(&page).unwrap(), Some(1));

        // the clock moves and the record shifts to slot 0
        page.delete(0).unwrap();
        assert_ne!(page.modify_clock(), saved.modify_clock);
        assert_eq!(saved.revalidate(&page).unwrap(), Some(0));

        page.delete(0).unwrap();
        assert_eq!(saved.revalidate(&page).unwrap(), None);
    }

    #[test]
    fn test_needs_enlarge() {
        let page = Page::new(PageId(1), 1, 1024);
        let record = IndexEntry::node_ptr(Mbr::rect(0.0, 0.0, 4.0, 4.0), PageId(2));
        let parent = ParentPathEntry {
            level: 1,
            page_id: PageId(1),
            child_page_id: PageId(2),
            mbr_increase: 0.0,
            saved_cursor: SavedCursor::capture(&page, 0, record),
            up: None,
        };
        assert!(!parent.needs_enlarge(&Mbr::rect(1.0, 1.0, 2.0, 2.0)));
        assert!(parent.needs_enlarge(&Mbr::rect(3.0, 3.0, 5.0, 4.0)));
        // zero-area growth still counts
        assert!(parent.needs_enlarge(&Mbr::rect(0.0, 4.0, 0.0, 6.0)));
    }
}
