//! Page store boundary and latch guards
//!
//! The index never owns pages. It fetches them from a [`PageStore`] with a
//! latch mode and mutates them only through the store's mutators, each of
//! which takes the open [`MutationScope`] so a before-image is captured and
//! a redo record is appended.

use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::trace;

use crate::entry::{IndexEntry, RecordFlags};
use crate::error::{Error, PageId, Result};
use crate::mbr::Mbr;
use crate::mtr::{Lsn, MutationScope, RedoRecord};
use crate::page::{validate_page_size, Page};
use crate::reader::{Epoch, ReaderPin, ReaderTable};
use crate::ssn::Ssn;

/// Page latch mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Shared latch, any number of readers
    Shared,
    /// Exclusive latch, required for mutation
    Exclusive,
}

enum PageLatch {
    Shared(ArcRwLockReadGuard<RawRwLock, Page>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Page>),
}

/// A latched page
///
/// The latch is held until the handle is dropped.
pub struct PageHandle {
    page_id: PageId,
    latch: PageLatch,
}

impl PageHandle {
    /// Wrap a shared latch guard
    pub fn shared(page_id: PageId, guard: ArcRwLockReadGuard<RawRwLock, Page>) -> Self {
        Self { page_id, latch: PageLatch::Shared(guard) }
    }

    /// Wrap an exclusive latch guard
    pub fn exclusive(page_id: PageId, guard: ArcRwLockWriteGuard<RawRwLock, Page>) -> Self {
        Self { page_id, latch: PageLatch::Exclusive(guard) }
    }

    /// Page identifier
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Latch held on the page
    pub fn mode(&self) -> LatchMode {
        match self.latch {
            PageLatch::Shared(_) => LatchMode::Shared,
            PageLatch::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    pub(crate) fn page_mut(&mut self) -> Result<&mut Page> {
        match &mut self.latch {
            PageLatch::Exclusive(guard) => Ok(&mut **guard),
            PageLatch::Shared(_) => Err(Error::Latch {
                page_id: self.page_id,
                held: LatchMode::Shared,
                wanted: LatchMode::Exclusive,
            }),
        }
    }
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        match &self.latch {
            PageLatch::Shared(guard) => &**guard,
            PageLatch::Exclusive(guard) => &**guard,
        }
    }
}

/// Header field change
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeaderUpdate {
    /// Sibling links
    Links {
        /// Left sibling
        prev: Option<PageId>,
        /// Right sibling
        next: Option<PageId>,
    },
    /// Page SSN
    Ssn(Ssn),
    /// Tree SSN persisted on the root
    TreeSsn(Ssn),
    /// Page level
    Level(u16),
    /// Root flag
    Root(bool),
}

impl HeaderUpdate {
    fn apply(&self, page: &mut Page) {
        match *self {
            HeaderUpdate::Links { prev, next } => page.set_links(prev, next),
            HeaderUpdate::Ssn(ssn) => page.set_ssn(ssn),
            HeaderUpdate::TreeSsn(ssn) => page.set_tree_ssn(ssn),
            HeaderUpdate::Level(level) => page.set_level(level),
            HeaderUpdate::Root(root) => page.set_root(root),
        }
    }
}

/// Storage collaborator providing latched pages
///
/// Implementors supply fetch, allocation and the rollback hooks. The
/// provided mutators capture before-images and log redo records; hosts
/// with their own page formats may override them.
pub trait PageStore: Send + Sync {
    /// Size of every page
    fn page_size(&self) -> usize;

    /// Latch and return a page
    fn fetch(&self, page_id: PageId, mode: LatchMode) -> Result<PageHandle>;

    /// Allocate an exclusively latched empty page at `level`
    ///
    /// `hint` names a page the new one should be placed near.
    fn alloc_page(&self, scope: &mut MutationScope<'_>, hint: Option<PageId>, level: u16) -> Result<PageHandle>;

    /// Free an exclusively latched page
    fn free_page(&self, scope: &mut MutationScope<'_>, page: PageHandle) -> Result<()>;

    /// Put a before-image back, re-creating the page if it was freed
    fn restore_page(&self, image: Page) -> Result<()>;

    /// Drop a page created by a scope that rolled back
    fn discard_page(&self, page_id: PageId) -> Result<()>;

    /// Hand a committed scope's records to the redo sink
    fn append_redo(&self, records: Vec<RedoRecord>) -> Result<Lsn>;

    /// Register a latch-free reader for the life of the returned pin
    ///
    /// Stores that recycle page ids must not hand out an id freed while a
    /// pin taken before the free is still held.
    fn pin_reader(&self) -> ReaderPin {
        ReaderPin::detached()
    }

    /// Insert an entry at `slot`
    fn insert_entry(
        &self,
        scope: &mut MutationScope<'_>,
        page: &mut PageHandle,
        slot: usize,
        entry: &IndexEntry,
        flags: RecordFlags,
    ) -> Result<()> {
        let record = entry.encode(flags)?;
        self.insert_record(scope, page, slot, record)
    }

    /// Insert an encoded record at `slot`
    fn insert_record(
        &self,
        scope: &mut MutationScope<'_>,
        page: &mut PageHandle,
        slot: usize,
        record: Vec<u8>,
    ) -> Result<()> {
        let page_id = page.page_id();
        let p = page.page_mut()?;
        if !p.fits(record.len()) {
            return Err(Error::PageFull { page_id, needed: record.len(), available: p.free_space() });
        }
        scope.capture(p);
        p.insert_record(slot, &record)?;
        scope.log(RedoRecord::InsertRecord { page_id, slot: slot as u16, record });
        Ok(())
    }

    /// Delete the record in `slot`
    fn delete_entry(&self, scope: &mut MutationScope<'_>, page: &mut PageHandle, slot: usize) -> Result<()> {
        let page_id = page.page_id();
        let p = page.page_mut()?;
        p.record(slot)?;
        scope.capture(p);
        p.delete(slot)?;
        scope.log(RedoRecord::DeleteRecord { page_id, slot: slot as u16 });
        Ok(())
    }

    /// Rewrite the MBR of the record in `slot` in place
    fn update_mbr_in_place(
        &self,
        scope: &mut MutationScope<'_>,
        page: &mut PageHandle,
        slot: usize,
        mbr: &Mbr,
    ) -> Result<()> {
        let page_id = page.page_id();
        let p = page.page_mut()?;
        p.record(slot)?;
        scope.capture(p);
        p.rewrite_mbr(slot, mbr)?;
        scope.log(RedoRecord::UpdateMbr { page_id, slot: slot as u16, mbr: *mbr });
        Ok(())
    }

    /// Replace the flags of the record in `slot`
    fn set_record_flags(
        &self,
        scope: &mut MutationScope<'_>,
        page: &mut PageHandle,
        slot: usize,
        flags: RecordFlags,
    ) -> Result<()> {
        let page_id = page.page_id();
        let p = page.page_mut()?;
        if p.record_flags(slot)? - RecordFlags::NODE_PTR == flags - RecordFlags::NODE_PTR {
            return Ok(());
        }
        scope.capture(p);
        p.set_record_flags(slot, flags)?;
        scope.log(RedoRecord::RecordFlags { page_id, slot: slot as u16, flags: flags.bits() });
        Ok(())
    }

    /// Reclaim fragmented space, `false` when there was none
    fn reorganize(&self, scope: &mut MutationScope<'_>, page: &mut PageHandle) -> Result<bool> {
        let page_id = page.page_id();
        let p = page.page_mut()?;
        if p.garbage() == 0 {
            return Ok(false);
        }
        scope.capture(p);
        let changed = p.reorganize();
        scope.log(RedoRecord::Reorganize { page_id });
        trace!(page_id = page_id.0, "page reorganized");
        Ok(changed)
    }

    /// Compact a page that lost records, `false` when nothing was gained
    ///
    /// Uncompressed stores compact by reorganizing.
    fn compress(&self, scope: &mut MutationScope<'_>, page: &mut PageHandle) -> Result<bool> {
        self.reorganize(scope, page)
    }

    /// Make `dst` hold a byte-identical copy of `src`'s records
    fn copy_page(&self, scope: &mut MutationScope<'_>, dst: &mut PageHandle, src: &Page) -> Result<()> {
        let (src_id, dst_id) = (src.page_id(), dst.page_id());
        let p = dst.page_mut()?;
        scope.capture(p);
        p.copy_records_from(src)?;
        scope.log(RedoRecord::CopyPage { src: src_id, dst: dst_id });
        Ok(())
    }

    /// Move the records in `slots` from `src` to the end of `dst`
    fn move_records(
        &self,
        scope: &mut MutationScope<'_>,
        src: &mut PageHandle,
        dst: &mut PageHandle,
        slots: &[usize],
    ) -> Result<()> {
        let (src_id, dst_id) = (src.page_id(), dst.page_id());
        let s = src.page_mut()?;
        let d = dst.page_mut()?;
        scope.capture(s);
        scope.capture(d);
        s.move_records_to(d, slots)?;
        scope.log(RedoRecord::MoveRecords { src: src_id, dst: dst_id, count: slots.len() as u16 });
        Ok(())
    }

    /// Change a header field
    fn update_header(&self, scope: &mut MutationScope<'_>, page: &mut PageHandle, update: HeaderUpdate) -> Result<()> {
        let page_id = page.page_id();
        let p = page.page_mut()?;
        scope.capture(p);
        update.apply(p);
        scope.log(RedoRecord::Header { page_id, update });
        Ok(())
    }

    /// Remove every record of a page
    fn clear_page(&self, scope: &mut MutationScope<'_>, page: &mut PageHandle) -> Result<()> {
        let page_id = page.page_id();
        let p = page.page_mut()?;
        scope.capture(p);
        p.clear();
        scope.log(RedoRecord::Clear { page_id });
        Ok(())
    }
}

/// Redo sink counters of a [`MemPageStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedoStats {
    /// Committed scopes
    pub batches: u64,
    /// Records across all committed scopes
    pub records: u64,
    /// LSN of the last record
    pub last_lsn: Lsn,
}

/// In-memory page store
///
/// Page ids start at 1. Freed ids are recycled, nearest to the hint first,
/// once no reader registered before the free is still running.
pub struct MemPageStore {
    page_size: usize,
    max_pages: u64,
    pages: RwLock<HashMap<PageId, Arc<RwLock<Page>>>>,
    free: Mutex<BTreeSet<PageId>>,
    pending: Mutex<Vec<(Epoch, PageId)>>,
    readers: Arc<ReaderTable>,
    next_page: AtomicU64,
    redo_batches: AtomicU64,
    redo_records: AtomicU64,
    last_lsn: AtomicU64,
    last_batch: Mutex<Vec<RedoRecord>>,
}

impl MemPageStore {
    /// Store with no page limit
    pub fn new(page_size: usize) -> Result<Self> {
        Self::with_max_pages(page_size, u64::MAX)
    }

    /// Store that fails allocation with [`Error::MapFull`] past `max_pages`
    pub fn with_max_pages(page_size: usize, max_pages: u64) -> Result<Self> {
        validate_page_size(page_size)?;
        if max_pages == 0 {
            return Err(Error::InvalidParameter("max_pages must be at least 1"));
        }
        Ok(Self {
            page_size,
            max_pages,
            pages: RwLock::new(HashMap::new()),
            free: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(Vec::new()),
            readers: Arc::new(ReaderTable::new()),
            next_page: AtomicU64::new(1),
            redo_batches: AtomicU64::new(0),
            redo_records: AtomicU64::new(0),
            last_lsn: AtomicU64::new(0),
            last_batch: Mutex::new(Vec::new()),
        })
    }

    /// Number of live pages
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Number of freed page ids awaiting reuse
    pub fn free_count(&self) -> usize {
        self.free.lock().len() + self.pending.lock().len()
    }

    /// Freed ids still held back for running readers
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Readers currently registered
    pub fn reader_count(&self) -> usize {
        self.readers.reader_count()
    }

    /// Redo sink counters
    pub fn redo_stats(&self) -> RedoStats {
        RedoStats {
            batches: self.redo_batches.load(Ordering::Acquire),
            records: self.redo_records.load(Ordering::Acquire),
            last_lsn: self.last_lsn.load(Ordering::Acquire),
        }
    }

    /// Records of the most recently committed scope
    pub fn last_redo_batch(&self) -> Vec<RedoRecord> {
        self.last_batch.lock().clone()
    }

    fn lock_for(&self, page_id: PageId) -> Result<Arc<RwLock<Page>>> {
        self.pages.read().get(&page_id).cloned().ok_or(Error::PageNotFound(page_id))
    }

    fn take_id(&self, hint: Option<PageId>) -> Result<PageId> {
        if self.pages.read().len() as u64 >= self.max_pages {
            return Err(Error::MapFull { max_pages: self.max_pages });
        }
        self.reclaim();
        let mut free = self.free.lock();
        let reused = match hint {
            Some(hint) => free.range(hint..).next().or_else(|| free.iter().next()).copied(),
            None => free.iter().next().copied(),
        };
        if let Some(id) = reused {
            free.remove(&id);
            return Ok(id);
        }
        Ok(PageId(self.next_page.fetch_add(1, Ordering::AcqRel)))
    }

    fn retire_id(&self, page_id: PageId) {
        let stamp = self.readers.retire();
        self.pending.lock().push((stamp, page_id));
    }

    /// Release held back ids no running reader can reach
    fn reclaim(&self) {
        let matured: Vec<PageId> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            let mut matured = Vec::new();
            pending.retain(|&(freed_at, page_id)| {
                let held = !self.readers.is_reclaimable(freed_at);
                if !held {
                    matured.push(page_id);
                }
                held
            });
            matured
        };
        if !matured.is_empty() {
            trace!(count = matured.len(), "freed page ids released for reuse");
            self.free.lock().extend(matured);
        }
    }
}

impl PageStore for MemPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn fetch(&self, page_id: PageId, mode: LatchMode) -> Result<PageHandle> {
        let lock = self.lock_for(page_id)?;
        Ok(match mode {
            LatchMode::Shared => PageHandle::shared(page_id, lock.read_arc()),
            LatchMode::Exclusive => PageHandle::exclusive(page_id, lock.write_arc()),
        })
    }

    fn alloc_page(&self, scope: &mut MutationScope<'_>, hint: Option<PageId>, level: u16) -> Result<PageHandle> {
        let page_id = self.take_id(hint)?;
        let lock = Arc::new(RwLock::new(Page::new(page_id, level, self.page_size)));
        let guard = lock.write_arc();
        self.pages.write().insert(page_id, lock);
        scope.note_created(page_id);
        scope.log(RedoRecord::PageCreate { page_id, level });
        trace!(page_id = page_id.0, level, "page allocated");
        Ok(PageHandle::exclusive(page_id, guard))
    }

    fn free_page(&self, scope: &mut MutationScope<'_>, mut page: PageHandle) -> Result<()> {
        let page_id = page.page_id();
        scope.capture(page.page_mut()?);
        scope.log(RedoRecord::PageFree { page_id });
        drop(page);
        self.pages.write().remove(&page_id);
        self.retire_id(page_id);
        trace!(page_id = page_id.0, "page freed");
        Ok(())
    }

    fn restore_page(&self, image: Page) -> Result<()> {
        let page_id = image.page_id();
        let existing = self.pages.read().get(&page_id).cloned();
        match existing {
            Some(lock) => *lock.write() = image,
            None => {
                self.pages.write().insert(page_id, Arc::new(RwLock::new(image)));
            }
        }
        self.free.lock().remove(&page_id);
        self.pending.lock().retain(|&(_, id)| id != page_id);
        Ok(())
    }

    fn discard_page(&self, page_id: PageId) -> Result<()> {
        // readers may have reached the page before the rollback
        if self.pages.write().remove(&page_id).is_some() {
            self.retire_id(page_id);
        }
        Ok(())
    }

    fn append_redo(&self, records: Vec<RedoRecord>) -> Result<Lsn> {
        let count = records.len() as u64;
        let lsn = self.last_lsn.fetch_add(count, Ordering::AcqRel) + count;
        self.redo_batches.fetch_add(1, Ordering::AcqRel);
        self.redo_records.fetch_add(count, Ordering::AcqRel);
        *self.last_batch.lock() = records;
        Ok(lsn)
    }

    fn pin_reader(&self) -> ReaderPin {
        ReaderTable::register(&self.readers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(i: u64) -> IndexEntry {
        IndexEntry::leaf(Mbr::point(i as f64, 0.0), i.to_be_bytes().to_vec())
    }

    #[test]
    fn test_alloc_fetch_and_latch_modes() {
        let store = MemPageStore::new(1024).unwrap();
        let id = {
            let mut scope = MutationScope::begin(&store);
            let mut page = store.alloc_page(&mut scope, None, 0).unwrap();
            assert_eq!(page.mode(), LatchMode::Exclusive);
            store.insert_entry(&mut scope, &mut page, 0, &leaf(1), RecordFlags::empty()).unwrap();
            let id = page.page_id();
            drop(page);
            scope.commit().unwrap();
            id
        };
        assert_eq!(id, PageId(1));

        let mut shared = store.fetch(id, LatchMode::Shared).unwrap();
        assert_eq!(shared.len(), 1);
        assert!(matches!(shared.page_mut(), Err(Error::Latch { .. })));
        drop(shared);
        assert!(matches!(store.fetch(PageId(99), LatchMode::Shared), Err(Error::PageNotFound(_))));
    }

    #[test]
    fn test_mutators_require_exclusive_latch() {
        let store = MemPageStore::new(1024).unwrap();
        let id = {
            let mut scope = MutationScope::begin(&store);
            let id = store.alloc_page(&mut scope, None, 0).unwrap().page_id();
            scope.commit().unwrap();
            id
        };
        let mut scope = MutationScope::begin(&store);
        let mut page = store.fetch(id, LatchMode::Shared).unwrap();
        let err = store.insert_entry(&mut scope, &mut page, 0, &leaf(1), RecordFlags::empty());
        assert!(matches!(err, Err(Error::Latch { wanted: LatchMode::Exclusive, .. })));
    }

    #[test]
    fn test_map_full_and_reuse() {
        let store = MemPageStore::with_max_pages(512, 2).unwrap();
        let mut scope = MutationScope::begin(&store);
        let a = store.alloc_page(&mut scope, None, 0).unwrap();
        let b = store.alloc_page(&mut scope, None, 0).unwrap();
        assert!(matches!(store.alloc_page(&mut scope, None, 0), Err(Error::MapFull { max_pages: 2 })));

        let freed = a.page_id();
        store.free_page(&mut scope, a).unwrap();
        assert_eq!(store.free_count(), 1);
        let c = store.alloc_page(&mut scope, Some(b.page_id()), 1).unwrap();
        assert_eq!(c.page_id(), freed);
        assert_eq!(c.level(), 1);
        drop(b);
        drop(c);
        scope.commit().unwrap();
        assert_eq!(store.page_count(), 2);
    }

    #[test]
    fn test_freed_id_held_for_running_reader() {
        let store = MemPageStore::new(512).unwrap();
        let mut scope = MutationScope::begin(&store);
        let a = store.alloc_page(&mut scope, None, 0).unwrap();
        let freed = a.page_id();

        let reader = store.pin_reader();
        assert_eq!(store.reader_count(), 1);
        store.free_page(&mut scope, a).unwrap();
        let late = store.pin_reader();
        assert_eq!(store.pending_count(), 1);

        let b = store.alloc_page(&mut scope, Some(freed), 0).unwrap();
        assert_ne!(b.page_id(), freed);
        assert!(matches!(store.fetch(freed, LatchMode::Shared), Err(Error::PageNotFound(_))));

        // only readers older than the free hold the id back
        drop(reader);
        let c = store.alloc_page(&mut scope, Some(freed), 0).unwrap();
        assert_eq!(c.page_id(), freed);
        assert_eq!(store.free_count(), 0);
        drop(late);
        drop(b);
        drop(c);
        scope.commit().unwrap();
        assert_eq!(store.reader_count(), 0);
    }

    #[test]
    fn test_redo_sink() {
        let store = MemPageStore::new(1024).unwrap();
        let mut scope = MutationScope::begin(&store);
        let mut page = store.alloc_page(&mut scope, None, 0).unwrap();
        store.insert_entry(&mut scope, &mut page, 0, &leaf(1), RecordFlags::empty()).unwrap();
        store.update_header(&mut scope, &mut page, HeaderUpdate::Ssn(4)).unwrap();
        drop(page);
        let lsn = scope.commit().unwrap();

        let stats = store.redo_stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.records, 3);
        assert_eq!(lsn, 3);
        let batch = store.last_redo_batch();
        assert!(matches!(batch[0], RedoRecord::PageCreate { level: 0, .. }));
        assert!(matches!(batch[2], RedoRecord::Header { update: HeaderUpdate::Ssn(4), .. }));
    }
}
