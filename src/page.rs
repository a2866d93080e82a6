//! Slotted index pages
//!
//! A page is an owned, size-bounded byte buffer plus a typed header. The
//! first [`PAGE_HEADER_SIZE`] bytes are reserved for the header, the slot
//! directory grows up behind it and records grow down from the end of the
//! buffer. Records are addressed by slot index only; any mutating call may
//! move record bytes, so slot offsets are never held across calls.

use std::cmp::Ordering;
use std::fmt;

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::comparator::CompareFn;
use crate::entry::{record_len, record_mbr, IndexEntry, RecordFlags};
use crate::error::{Error, PageId, Result};
use crate::mbr::Mbr;
use crate::ssn::Ssn;

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size
pub const MAX_PAGE_SIZE: usize = 65536;

/// Bytes reserved for the page header
pub const PAGE_HEADER_SIZE: usize = 64;

/// Bytes per slot directory entry
pub const SLOT_SIZE: usize = 2;

const_assert!(DEFAULT_PAGE_SIZE >= MIN_PAGE_SIZE);
const_assert!(MAX_PAGE_SIZE <= u16::MAX as usize + 1);
const_assert!(MIN_PAGE_SIZE.is_power_of_two());

bitflags! {
    /// Flags for page kinds
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Leaf page holding row entries
        const LEAF = 0x01;
        /// Branch page holding directory entries
        const BRANCH = 0x02;
        /// Root page of the tree
        const ROOT = 0x04;
    }
}

/// Largest record a page of `page_size` accepts
///
/// Four records must always fit so that a split leaves both halves
/// non-empty and the pending entry placeable.
pub fn max_entry_len(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 4 - SLOT_SIZE
}

/// Check a page size is usable
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(Error::InvalidParameter("page size must be a power of two in 512..=65536"));
    }
    Ok(())
}

/// R-tree page
#[derive(Clone)]
pub struct Page {
    page_id: PageId,
    flags: PageFlags,
    level: u16,
    prev: Option<PageId>,
    next: Option<PageId>,
    ssn: Ssn,
    tree_ssn: Ssn,
    modify_clock: u64,
    data: Box<[u8]>,
    slots: Vec<u16>,
    upper: usize,
    garbage: usize,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id)
            .field("flags", &self.flags)
            .field("level", &self.level)
            .field("prev", &self.prev)
            .field("next", &self.next)
            .field("ssn", &self.ssn)
            .field("entries", &self.slots.len())
            .field("free", &self.free_space())
            .field("garbage", &self.garbage)
            .finish()
    }
}

impl Page {
    /// Create an empty page
    pub fn new(page_id: PageId, level: u16, page_size: usize) -> Self {
        Self {
            page_id,
            flags: Self::level_flags(level),
            level,
            prev: None,
            next: None,
            ssn: 0,
            tree_ssn: 0,
            modify_clock: 0,
            data: vec![0u8; page_size].into_boxed_slice(),
            slots: Vec::new(),
            upper: page_size,
            garbage: 0,
        }
    }

    fn level_flags(level: u16) -> PageFlags {
        if level == 0 {
            PageFlags::LEAF
        } else {
            PageFlags::BRANCH
        }
    }

    /// Page identifier
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Page flags
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Height above the leaves, 0 for a leaf
    pub fn level(&self) -> u16 {
        self.level
    }

    /// Whether this is a leaf page
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Whether this is the root page
    pub fn is_root(&self) -> bool {
        self.flags.contains(PageFlags::ROOT)
    }

    /// Left sibling on the same level
    pub fn prev(&self) -> Option<PageId> {
        self.prev
    }

    /// Right sibling on the same level
    pub fn next(&self) -> Option<PageId> {
        self.next
    }

    /// Split sequence number
    pub fn ssn(&self) -> Ssn {
        self.ssn
    }

    /// Tree SSN persisted on the root
    pub fn tree_ssn(&self) -> Ssn {
        self.tree_ssn
    }

    /// Counter bumped by every mutation
    pub fn modify_clock(&self) -> u64 {
        self.modify_clock
    }

    /// Total buffer size
    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the page holds no records
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Fragmented bytes left behind by deletions
    pub fn garbage(&self) -> usize {
        self.garbage
    }

    fn touch(&mut self) {
        self.modify_clock += 1;
    }

    /// Change the page level, adjusting the leaf/branch flag
    pub fn set_level(&mut self, level: u16) {
        self.level = level;
        self.flags.remove(PageFlags::LEAF | PageFlags::BRANCH);
        self.flags |= Self::level_flags(level);
        self.touch();
    }

    /// Set the sibling links
    pub fn set_links(&mut self, prev: Option<PageId>, next: Option<PageId>) {
        self.prev = prev;
        self.next = next;
        self.touch();
    }

    /// Set the split sequence number
    pub fn set_ssn(&mut self, ssn: Ssn) {
        debug_assert!(ssn >= self.ssn || self.is_empty(), "page SSN must not decrease");
        self.ssn = ssn;
        self.touch();
    }

    /// Set the persisted tree SSN
    pub fn set_tree_ssn(&mut self, ssn: Ssn) {
        self.tree_ssn = ssn;
        self.touch();
    }

    /// Mark or unmark the page as the root
    pub fn set_root(&mut self, root: bool) {
        self.flags.set(PageFlags::ROOT, root);
        self.touch();
    }

    /// Usable bytes for slots and records
    pub fn usable_space(&self) -> usize {
        self.data.len() - PAGE_HEADER_SIZE
    }

    /// Bytes between the slot directory and the record area
    pub fn contiguous_free(&self) -> usize {
        self.upper - (PAGE_HEADER_SIZE + self.slots.len() * SLOT_SIZE)
    }

    /// Free bytes including fragmented space
    pub fn free_space(&self) -> usize {
        self.contiguous_free() + self.garbage
    }

    /// Bytes taken by live records and their slots
    pub fn used_bytes(&self) -> usize {
        self.usable_space() - self.free_space()
    }

    /// Occupancy as a percentage of the usable space
    pub fn fill_percent(&self) -> usize {
        self.used_bytes() * 100 / self.usable_space()
    }

    /// Whether a record of `len` bytes fits without reorganizing
    pub fn fits(&self, len: usize) -> bool {
        self.contiguous_free() >= len + SLOT_SIZE
    }

    /// Whether a record of `len` bytes fits once garbage is reclaimed
    pub fn fits_after_reorganize(&self, len: usize) -> bool {
        self.free_space() >= len + SLOT_SIZE
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.slots.len() {
            return Err(Error::Corruption {
                details: format!("slot {} out of range ({} records)", slot, self.slots.len()),
                page_id: Some(self.page_id),
            });
        }
        Ok(())
    }

    /// Raw bytes of the record in `slot`
    pub fn record(&self, slot: usize) -> Result<&[u8]> {
        self.check_slot(slot)?;
        let at = self.slots[slot] as usize;
        let len = record_len(&self.data[at..])?;
        Ok(&self.data[at..at + len])
    }

    /// Decoded entry in `slot`
    pub fn entry(&self, slot: usize) -> Result<IndexEntry> {
        Ok(IndexEntry::decode(self.record(slot)?)?.0)
    }

    /// Flags of the record in `slot`
    pub fn record_flags(&self, slot: usize) -> Result<RecordFlags> {
        self.check_slot(slot)?;
        Ok(RecordFlags::from_bits_truncate(self.data[self.slots[slot] as usize]))
    }

    /// Bounding box of the record in `slot`
    pub fn entry_mbr(&self, slot: usize) -> Result<Mbr> {
        record_mbr(self.record(slot)?)
    }

    /// All entries in slot order
    pub fn entries(&self) -> Result<Vec<IndexEntry>> {
        (0..self.len()).map(|slot| self.entry(slot)).collect()
    }

    /// Union of every record's MBR, `None` for an empty page
    pub fn compute_mbr(&self) -> Result<Option<Mbr>> {
        let mut acc: Option<Mbr> = None;
        for slot in 0..self.len() {
            let mbr = self.entry_mbr(slot)?;
            acc = Some(acc.map_or(mbr, |a| a.join(&mbr)));
        }
        Ok(acc)
    }

    /// Slot of the directory entry pointing at `child`
    pub fn find_child(&self, child: PageId) -> Result<Option<usize>> {
        for slot in 0..self.len() {
            if self.entry(slot)?.child() == Some(child) {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Slot of a record equal to `entry`, flags ignored
    pub fn find_entry(&self, entry: &IndexEntry) -> Result<Option<usize>> {
        for slot in 0..self.len() {
            if self.entry(slot)?.same_record(entry) {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Slot at which `entry` keeps the page ordered
    ///
    /// Positions after the last record whose sort key is not greater than
    /// the new one. A min-record marker in slot 0 is never displaced.
    pub fn insert_position(&self, entry: &IndexEntry, cmp: CompareFn) -> Result<usize> {
        let mut pos = 0;
        for slot in 0..self.len() {
            if self.entry(slot)?.sort_cmp(entry, cmp) == Ordering::Greater {
                break;
            }
            pos = slot + 1;
        }
        if pos == 0 && !self.is_empty() && self.record_flags(0)?.contains(RecordFlags::MIN_REC) {
            pos = 1;
        }
        Ok(pos)
    }

    /// Insert an encoded record at `slot`
    pub fn insert_record(&mut self, slot: usize, record: &[u8]) -> Result<()> {
        if slot > self.slots.len() {
            return Err(Error::InvalidParameter("insert slot past the end of the page"));
        }
        if !self.fits(record.len()) {
            return Err(Error::PageFull {
                page_id: self.page_id,
                needed: record.len() + SLOT_SIZE,
                available: self.free_space(),
            });
        }
        let at = self.upper - record.len();
        self.data[at..self.upper].copy_from_slice(record);
        self.upper = at;
        self.slots.insert(slot, at as u16);
        self.touch();
        Ok(())
    }

    /// Encode and insert an entry at `slot`
    pub fn insert_entry(&mut self, slot: usize, entry: &IndexEntry, flags: RecordFlags) -> Result<()> {
        let record = entry.encode(flags)?;
        self.insert_record(slot, &record)
    }

    /// Delete the record in `slot`, returning its length
    pub fn delete(&mut self, slot: usize) -> Result<usize> {
        let len = self.record(slot)?.len();
        let at = self.slots.remove(slot) as usize;
        if at == self.upper {
            self.upper += len;
        } else {
            self.garbage += len;
        }
        if self.slots.is_empty() {
            self.upper = self.data.len();
            self.garbage = 0;
        }
        self.touch();
        Ok(len)
    }

    /// Overwrite the MBR of the record in `slot` without moving it
    pub fn rewrite_mbr(&mut self, slot: usize, mbr: &Mbr) -> Result<()> {
        self.record(slot)?;
        let at = self.slots[slot] as usize + 1;
        mbr.encode_into(&mut self.data[at..at + crate::mbr::MBR_ENCODED_SIZE]);
        self.touch();
        Ok(())
    }

    /// Replace the flags of the record in `slot`, keeping `NODE_PTR`
    pub fn set_record_flags(&mut self, slot: usize, flags: RecordFlags) -> Result<()> {
        let current = self.record_flags(slot)?;
        let kept = current & RecordFlags::NODE_PTR;
        self.data[self.slots[slot] as usize] = (kept | (flags - RecordFlags::NODE_PTR)).bits();
        self.touch();
        Ok(())
    }

    /// Compact records to reclaim garbage, `false` when there was none
    pub fn reorganize(&mut self) -> bool {
        if self.garbage == 0 {
            return false;
        }
        let mut compacted = vec![0u8; self.data.len()].into_boxed_slice();
        let mut upper = self.data.len();
        for slot in self.slots.iter_mut() {
            let at = *slot as usize;
            // Slots were validated on insert; a bad length here means the
            // buffer is damaged and the record is copied as far as it goes.
            let len = record_len(&self.data[at..]).unwrap_or(self.data.len() - at);
            upper -= len;
            compacted[upper..upper + len].copy_from_slice(&self.data[at..at + len]);
            *slot = upper as u16;
        }
        self.data = compacted;
        self.upper = upper;
        self.garbage = 0;
        self.touch();
        true
    }

    /// Replace this page's records with a byte-identical copy of `src`'s
    pub fn copy_records_from(&mut self, src: &Page) -> Result<()> {
        if src.page_size() != self.page_size() {
            return Err(Error::InvalidParameter("page copy between different page sizes"));
        }
        self.data.copy_from_slice(&src.data);
        self.slots.clone_from(&src.slots);
        self.upper = src.upper;
        self.garbage = src.garbage;
        self.touch();
        Ok(())
    }

    /// Move the records in `slots` to the end of `dst`, preserving order
    ///
    /// Fails with [`Error::PageFull`] before touching either page when
    /// `dst` cannot take every record.
    pub fn move_records_to(&mut self, dst: &mut Page, slots: &[usize]) -> Result<()> {
        let mut sorted = slots.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut records = Vec::with_capacity(sorted.len());
        let mut needed = 0;
        for &slot in &sorted {
            let record = self.record(slot)?.to_vec();
            needed += record.len() + SLOT_SIZE;
            records.push(record);
        }
        if dst.free_space() < needed {
            return Err(Error::PageFull {
                page_id: dst.page_id,
                needed,
                available: dst.free_space(),
            });
        }
        if dst.contiguous_free() < needed {
            dst.reorganize();
        }
        for record in &records {
            dst.insert_record(dst.len(), record)?;
        }
        for &slot in sorted.iter().rev() {
            self.delete(slot)?;
        }
        Ok(())
    }

    /// Remove every record
    pub fn clear(&mut self) {
        self.slots.clear();
        self.upper = self.data.len();
        self.garbage = 0;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{Comparator, LexicographicComparator};

    fn leaf(i: u64) -> IndexEntry {
        IndexEntry::leaf(Mbr::rect(i as f64, 0.0, i as f64 + 1.0, 1.0), i.to_be_bytes().to_vec())
    }

    #[test]
    fn test_insert_and_read() {
        let mut page = Page::new(PageId(1), 0, 512);
        assert!(page.is_leaf());
        assert!(page.flags().contains(PageFlags::LEAF));
        page.insert_entry(0, &leaf(2), RecordFlags::empty()).unwrap();
        page.insert_entry(0, &leaf(1), RecordFlags::empty()).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.entry(0).unwrap(), leaf(1));
        assert_eq!(page.entry(1).unwrap(), leaf(2));
        assert_eq!(page.compute_mbr().unwrap(), Some(Mbr::rect(1.0, 0.0, 3.0, 1.0)));
        assert_eq!(page.used_bytes(), 2 * (leaf(1).encoded_len() + SLOT_SIZE));
    }

    #[test]
    fn test_page_full() {
        let mut page = Page::new(PageId(1), 0, 512);
        let mut inserted = 0;
        loop {
            match page.insert_entry(page.len(), &leaf(inserted), RecordFlags::empty()) {
                Ok(()) => inserted += 1,
                Err(Error::PageFull { page_id, .. }) => {
                    assert_eq!(page_id, PageId(1));
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        // (512 - 64) / 45 records of 43 bytes
        assert_eq!(inserted, 9);
        assert!(!page.fits(leaf(0).encoded_len()));
    }

    #[test]
    fn test_delete_and_reorganize() {
        let mut page = Page::new(PageId(1), 0, 512);
        for i in 0..9 {
            page.insert_entry(page.len(), &leaf(i), RecordFlags::empty()).unwrap();
        }
        let clock = page.modify_clock();
        page.delete(3).unwrap();
        assert!(page.modify_clock() > clock);
        assert_eq!(page.garbage(), leaf(0).encoded_len());
        assert!(page.fits_after_reorganize(2 * leaf(0).encoded_len()));
        assert!(!page.fits(2 * leaf(0).encoded_len()));
        assert!(page.reorganize());
        assert!(!page.reorganize());
        assert_eq!(page.garbage(), 0);
        page.insert_entry(3, &leaf(3), RecordFlags::empty()).unwrap();
        for i in 0..9 {
            assert_eq!(page.entry(i as usize).unwrap(), leaf(i));
        }
    }

    #[test]
    fn test_move_records_preserves_order() {
        let mut src = Page::new(PageId(1), 0, 1024);
        let mut dst = Page::new(PageId(2), 0, 1024);
        for i in 0..6 {
            src.insert_entry(src.len(), &leaf(i), RecordFlags::empty()).unwrap();
        }
        src.move_records_to(&mut dst, &[4, 1, 2]).unwrap();
        assert_eq!(src.entries().unwrap(), vec![leaf(0), leaf(3), leaf(5)]);
        assert_eq!(dst.entries().unwrap(), vec![leaf(1), leaf(2), leaf(4)]);
    }

    #[test]
    fn test_move_records_rejects_overflow_untouched() {
        let mut src = Page::new(PageId(1), 0, 512);
        let mut dst = Page::new(PageId(2), 0, 512);
        for i in 0..9 {
            src.insert_entry(src.len(), &leaf(i), RecordFlags::empty()).unwrap();
            dst.insert_entry(dst.len(), &leaf(i + 100), RecordFlags::empty()).unwrap();
        }
        let before = src.entries().unwrap();
        assert!(matches!(src.move_records_to(&mut dst, &[0, 1]), Err(Error::PageFull { .. })));
        assert_eq!(src.entries().unwrap(), before);
        assert_eq!(dst.len(), 9);
    }

    #[test]
    fn test_insert_position_keeps_min_rec() {
        let cmp = LexicographicComparator::compare;
        let mut page = Page::new(PageId(1), 1, 1024);
        let ptr = |x: f64, id: u64| IndexEntry::node_ptr(Mbr::rect(x, 0.0, x + 1.0, 1.0), PageId(id));
        page.insert_entry(0, &ptr(5.0, 10), RecordFlags::MIN_REC).unwrap();
        page.insert_entry(1, &ptr(8.0, 11), RecordFlags::empty()).unwrap();

        assert_eq!(page.insert_position(&ptr(6.0, 12), cmp).unwrap(), 1);
        assert_eq!(page.insert_position(&ptr(9.0, 12), cmp).unwrap(), 2);
        // sorts before slot 0, but the marker stays first
        assert_eq!(page.insert_position(&ptr(0.0, 12), cmp).unwrap(), 1);

        page.set_record_flags(0, RecordFlags::empty()).unwrap();
        assert_eq!(page.insert_position(&ptr(0.0, 12), cmp).unwrap(), 0);
        assert!(page.record_flags(0).unwrap().contains(RecordFlags::NODE_PTR));
    }

    #[test]
    fn test_rewrite_mbr_in_place() {
        let mut page = Page::new(PageId(1), 1, 1024);
        let ptr = IndexEntry::node_ptr(Mbr::rect(0.0, 0.0, 1.0, 1.0), PageId(7));
        page.insert_entry(0, &ptr, RecordFlags::MIN_REC).unwrap();
        let free = page.free_space();
        page.rewrite_mbr(0, &Mbr::rect(-1.0, -1.0, 2.0, 2.0)).unwrap();
        assert_eq!(page.free_space(), free);
        assert_eq!(page.entry_mbr(0).unwrap(), Mbr::rect(-1.0, -1.0, 2.0, 2.0));
        assert_eq!(page.find_child(PageId(7)).unwrap(), Some(0));
        assert!(page.record_flags(0).unwrap().contains(RecordFlags::MIN_REC));
    }

    #[test]
    fn test_copy_records_and_levels() {
        let mut src = Page::new(PageId(1), 0, 512);
        src.insert_entry(0, &leaf(1), RecordFlags::empty()).unwrap();
        let mut dst = Page::new(PageId(2), 0, 512);
        dst.copy_records_from(&src).unwrap();
        assert_eq!(dst.entries().unwrap(), src.entries().unwrap());

        dst.set_level(2);
        assert!(dst.flags().contains(PageFlags::BRANCH));
        assert!(!dst.flags().contains(PageFlags::LEAF));
        assert!(dst.copy_records_from(&Page::new(PageId(3), 0, 1024)).is_err());
    }

    #[test]
    fn test_page_size_limits() {
        assert!(validate_page_size(4096).is_ok());
        assert!(validate_page_size(256).is_err());
        assert!(validate_page_size(3000).is_err());
        assert_eq!(max_entry_len(4096), 1006);
    }
}
