//! R-tree facade
//!
//! [`RTree`] ties the page store, lock coordinator and configuration
//! together. Readers run without the tree latch; every write takes it
//! exclusively for the whole operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, trace};

use crate::comparator::CompareFn;
use crate::config::TreeConfig;
use crate::cursor::{descend_for_insert, locate_entry, InsertTarget, QueryMode, RtreeCursor};
use crate::entry::IndexEntry;
use crate::error::{Error, PageId, Result, TransactionId};
use crate::estimate::{estimate_rows, RowEstimate};
use crate::lock::{LockCoordinator, PredicateMode};
use crate::mbr::{Mbr, SpatialRef};
use crate::mtr::MutationScope;
use crate::node_split::split_and_insert;
use crate::page::max_entry_len;
use crate::parent::{after_leaf_delete, cover_entry, enlarge_ancestors, try_insert_with_reorganize};
use crate::path::latch_path_exclusive;
use crate::ssn::{Ssn, SsnCounter};
use crate::store::{HeaderUpdate, LatchMode, PageStore};
use crate::validate::{validate_mbr_containment, TreeShape};

/// Structural event counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Leaf page splits
    pub leaf_splits: u64,
    /// Directory page splits
    pub branch_splits: u64,
    /// Root raises
    pub root_raises: u64,
    /// Split retries
    pub split_retries: u64,
    /// Page merges
    pub merges: u64,
    /// Pages freed
    pub pages_freed: u64,
    /// Right links followed by readers after a concurrent split
    pub ssn_chases: u64,
    /// Saved positions relocated by content
    pub restore_fallbacks: u64,
    /// Root lifts
    pub root_lifts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    leaf_splits: AtomicU64,
    branch_splits: AtomicU64,
    root_raises: AtomicU64,
    split_retries: AtomicU64,
    merges: AtomicU64,
    pages_freed: AtomicU64,
    ssn_chases: AtomicU64,
    restore_fallbacks: AtomicU64,
    root_lifts: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl StatCounters {
    counter!(leaf_split, leaf_splits);
    counter!(branch_split, branch_splits);
    counter!(root_raise, root_raises);
    counter!(split_retry, split_retries);
    counter!(merge, merges);
    counter!(page_freed, pages_freed);
    counter!(ssn_chase, ssn_chases);
    counter!(restore_fallback, restore_fallbacks);
    counter!(root_lift, root_lifts);

    pub(crate) fn snapshot(&self) -> TreeStats {
        TreeStats {
            leaf_splits: self.leaf_splits.load(Ordering::Relaxed),
            branch_splits: self.branch_splits.load(Ordering::Relaxed),
            root_raises: self.root_raises.load(Ordering::Relaxed),
            split_retries: self.split_retries.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
            ssn_chases: self.ssn_chases.load(Ordering::Relaxed),
            restore_fallbacks: self.restore_fallbacks.load(Ordering::Relaxed),
            root_lifts: self.root_lifts.load(Ordering::Relaxed),
        }
    }
}

/// Shared state of one tree, borrowed by cursors and write paths
pub struct TreeCore {
    pub(crate) store: Arc<dyn PageStore>,
    pub(crate) locks: Arc<dyn LockCoordinator>,
    pub(crate) config: TreeConfig,
    pub(crate) ssn: SsnCounter,
    pub(crate) stats: StatCounters,
    pub(crate) root: PageId,
    pub(crate) cmp: CompareFn,
}

impl TreeCore {
    /// Root page id
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Current tree SSN
    pub fn current_ssn(&self) -> Ssn {
        self.ssn.current_ssn()
    }

    pub(crate) fn spatial_ref(&self) -> Option<&SpatialRef> {
        self.config.spatial_ref.as_ref()
    }
}

/// A concurrent R-tree over a page store
pub struct RTree {
    core: TreeCore,
    tree_latch: RwLock<()>,
    rows: AtomicU64,
}

impl RTree {
    pub(crate) fn create_with(
        store: Arc<dyn PageStore>,
        locks: Arc<dyn LockCoordinator>,
        config: TreeConfig,
        cmp: CompareFn,
    ) -> Result<Self> {
        config.validate()?;
        if store.page_size() != config.page_size {
            return Err(Error::InvalidParameter("store page size differs from the configured page size"));
        }
        let root = {
            let mut scope = MutationScope::begin(&*store);
            let root = {
                let mut page = store.alloc_page(&mut scope, None, 0)?;
                store.update_header(&mut scope, &mut page, HeaderUpdate::Root(true))?;
                page.page_id()
            };
            scope.commit()?;
            root
        };
        debug!(root = root.0, page_size = config.page_size, "tree created");
        Ok(Self::assemble(store, locks, config, cmp, root, SsnCounter::default(), 0))
    }

    pub(crate) fn open_with(
        store: Arc<dyn PageStore>,
        locks: Arc<dyn LockCoordinator>,
        config: TreeConfig,
        cmp: CompareFn,
        root: PageId,
    ) -> Result<Self> {
        config.validate()?;
        if store.page_size() != config.page_size {
            return Err(Error::InvalidParameter("store page size differs from the configured page size"));
        }
        let tree_ssn = {
            let page = match store.fetch(root, LatchMode::Shared) {
                Ok(page) => page,
                Err(Error::PageNotFound(id)) => {
                    error!(page_id = id.0, "tree root does not exist");
                    return Err(Error::corruption("tree root does not exist", id));
                }
                Err(e) => return Err(e),
            };
            if !page.is_root() {
                error!(page_id = root.0, level = page.level(), "page is not an index root");
                return Err(Error::corruption("page is not an index root", root));
            }
            page.tree_ssn()
        };
        let tree = Self::assemble(store, locks, config, cmp, root, SsnCounter::new(tree_ssn), 0);
        let shape = validate_mbr_containment(&tree.core)?;
        tree.rows.store(shape.entries, Ordering::Release);
        debug!(root = root.0, ssn = tree_ssn, rows = shape.entries, "tree opened");
        Ok(tree)
    }

    fn assemble(
        store: Arc<dyn PageStore>,
        locks: Arc<dyn LockCoordinator>,
        config: TreeConfig,
        cmp: CompareFn,
        root: PageId,
        ssn: SsnCounter,
        rows: u64,
    ) -> Self {
        Self {
            core: TreeCore { store, locks, config, ssn, stats: StatCounters::default(), root, cmp },
            tree_latch: RwLock::new(()),
            rows: AtomicU64::new(rows),
        }
    }

    /// Root page id, stable for the life of the tree
    pub fn root(&self) -> PageId {
        self.core.root
    }

    /// Current tree SSN
    pub fn current_ssn(&self) -> Ssn {
        self.core.ssn.current_ssn()
    }

    /// Number of leaf entries
    pub fn len(&self) -> u64 {
        self.rows.load(Ordering::Acquire)
    }

    /// Whether the tree holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tree configuration
    pub fn config(&self) -> &TreeConfig {
        &self.core.config
    }

    /// Page store the tree lives in
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.core.store
    }

    /// Structural event counters
    pub fn stats(&self) -> TreeStats {
        self.core.stats.snapshot()
    }

    /// Shared state for cursors
    pub fn core(&self) -> &TreeCore {
        &self.core
    }

    /// Insert a leaf entry
    ///
    /// The MBR is validated before any page is touched. On error every
    /// page is left as it was.
    pub fn insert(&self, txn: TransactionId, mbr: Mbr, payload: impl Into<Vec<u8>>) -> Result<()> {
        mbr.validate()?;
        let entry = IndexEntry::leaf(mbr, payload);
        if entry.encoded_len() > max_entry_len(self.core.config.page_size) {
            return Err(Error::InvalidParameter("entry exceeds the maximum record size"));
        }

        let _latch = self.tree_latch.write();
        let core = &self.core;
        let target = descend_for_insert(core, &mbr)?;
        core.locks.place_predicate_lock(txn, target.leaf, &mbr, PredicateMode::InsertIntention)?;

        let mut scope = MutationScope::with_locks(&*core.store, &*core.locks);
        let grows = target.parents.iter().any(|p| p.needs_enlarge(&mbr));
        if grows || !self.insert_optimistic(&mut scope, target.leaf, &entry)? {
            self.insert_pessimistic(&mut scope, &target, &entry)?;
        }
        scope.commit()?;
        self.rows.fetch_add(1, Ordering::AcqRel);
        trace!(leaf = target.leaf.0, "entry inserted");
        Ok(())
    }

    fn insert_optimistic(&self, scope: &mut MutationScope<'_>, leaf: PageId, entry: &IndexEntry) -> Result<bool> {
        let core = &self.core;
        let mut page = core.store.fetch(leaf, LatchMode::Exclusive)?;
        if !page.is_leaf() {
            error!(page_id = leaf.0, level = page.level(), "insert descent ended above the leaves");
            return Err(Error::corruption("insert target is not a leaf", leaf));
        }
        let pos = page.insert_position(entry, core.cmp)?;
        try_insert_with_reorganize(core, scope, &mut page, pos, entry)
    }

    fn insert_pessimistic(&self, scope: &mut MutationScope<'_>, target: &InsertTarget, entry: &IndexEntry) -> Result<()> {
        let core = &self.core;
        let mut path = latch_path_exclusive(core, &target.parents, target.leaf, 0)?;
        let idx = path.len() - 1;
        let pos = path.get(idx).insert_position(entry, core.cmp)?;
        let placed_on = if try_insert_with_reorganize(core, scope, path.get_mut(idx), pos, entry)? {
            if !enlarge_ancestors(core, scope, &mut path, entry.mbr())? {
                return Ok(());
            }
            target.leaf
        } else {
            split_and_insert(core, scope, &mut path, idx, entry)?.placed_on
        };
        path.clear();
        cover_entry(core, scope, placed_on, entry.mbr())
    }

    /// Delete the leaf entry with exactly this MBR and payload
    ///
    /// Returns `false` when no such entry exists. Emptied pages are freed
    /// and underfull pages merged with a sibling.
    pub fn delete(&self, txn: TransactionId, mbr: &Mbr, payload: &[u8]) -> Result<bool> {
        mbr.validate()?;
        let entry = IndexEntry::leaf(*mbr, payload);

        let _latch = self.tree_latch.write();
        let core = &self.core;
        let Some((saved, parents)) = locate_entry(core, &entry)? else {
            return Ok(false);
        };
        core.locks.place_predicate_lock(txn, saved.page_id, mbr, PredicateMode::Exclusive)?;

        let mut scope = MutationScope::with_locks(&*core.store, &*core.locks);
        {
            let mut path = latch_path_exclusive(core, &parents, saved.page_id, 0)?;
            let idx = path.len() - 1;
            let Some(slot) = saved.revalidate(path.get(idx))? else {
                error!(page_id = saved.page_id.0, record = ?entry, "located entry vanished from its leaf");
                return Err(Error::corruption("located entry vanished from its leaf", saved.page_id));
            };
            core.store.delete_entry(&mut scope, path.get_mut(idx), slot)?;
            after_leaf_delete(core, &mut scope, &mut path)?;
        }
        scope.commit()?;
        self.rows.fetch_sub(1, Ordering::AcqRel);
        trace!(page_id = saved.page_id.0, "entry deleted");
        Ok(true)
    }

    /// Cursor over entries matching `query` under `mode`
    pub fn cursor(&self, mode: QueryMode, query: Mbr) -> Result<RtreeCursor<'_>> {
        RtreeCursor::new(&self.core, mode, query)
    }

    /// Collect every leaf entry matching `query` under `mode`
    pub fn search(&self, mode: QueryMode, query: &Mbr) -> Result<Vec<IndexEntry>> {
        check_range_mode(mode)?;
        self.cursor(mode, *query)?.map(|m| m.map(|m| m.into_entry())).collect()
    }

    /// Like [`RTree::search`], placing a shared predicate lock for `txn`
    /// on every leaf visited
    pub fn search_locked(&self, txn: TransactionId, mode: QueryMode, query: &Mbr) -> Result<Vec<IndexEntry>> {
        check_range_mode(mode)?;
        self.cursor(mode, *query)?
            .with_predicate_lock(txn)
            .map(|m| m.map(|m| m.into_entry()))
            .collect()
    }

    /// Estimate the number of entries matching `query`
    pub fn estimate_rows(&self, mode: QueryMode, query: &Mbr) -> Result<RowEstimate> {
        estimate_rows(&self.core, mode, query, self.len())
    }

    /// Check every structural invariant, excluding concurrent writers
    pub fn validate(&self) -> Result<TreeShape> {
        let _latch = self.tree_latch.read();
        validate_mbr_containment(&self.core)
    }
}

fn check_range_mode(mode: QueryMode) -> Result<()> {
    match mode {
        QueryMode::Contains | QueryMode::Intersects | QueryMode::Disjoint | QueryMode::Within | QueryMode::Equal => {
            Ok(())
        }
        QueryMode::NearestForInsert | QueryMode::GetExactParent(_) => {
            Err(Error::InvalidParameter("search mode must be a spatial predicate"))
        }
    }
}
