//! Concurrent R-tree traversal
//!
//! A cursor keeps a stack of pages to visit. Readers latch one page at a
//! time and take no tree latch, so pages may split between being queued
//! and being visited. Each queued page records the tree SSN at queue time;
//! a page whose live SSN is larger has split since, and its right sibling
//! is queued with the same recorded SSN so moved entries are still seen.
//!
//! Matches are copied out of the page before its latch is released. A
//! cursor stays registered with the store while it lives, so the id of a
//! page freed under it is not handed to a new page until it is dropped.

use std::collections::VecDeque;

use tracing::{debug, error, trace};

use crate::entry::IndexEntry;
use crate::error::{Error, PageId, Result, TransactionId};
use crate::lock::PredicateMode;
use crate::mbr::{area, area_increase, contains, disjoint, equals, intersects, within, Mbr};
use crate::page::Page;
use crate::path::{ParentPathEntry, SavedCursor, SearchPathEntry};
use crate::reader::ReaderPin;
use crate::store::LatchMode;
use crate::tree::TreeCore;

/// Search mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Entries containing the query
    Contains,
    /// Entries overlapping the query
    Intersects,
    /// Entries not overlapping the query
    Disjoint,
    /// Entries inside the query
    Within,
    /// Entries equal to the query
    Equal,
    /// Single descent to the leaf an insert of the query should go to
    NearestForInsert,
    /// Directory entry referencing the given child page
    GetExactParent(PageId),
}

/// Cursor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Pages left to visit, nothing buffered
    Descending,
    /// Leaf matches buffered
    MatchedLeaf,
    /// Directory matches buffered
    MatchedInternal,
    /// Nothing left
    Exhausted,
}

/// A matching record
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Position of the record
    pub saved: SavedCursor,
    /// Arena index of the directory entry that led to its page
    pub parent: Option<usize>,
}

impl Match {
    /// The matching entry
    pub fn entry(&self) -> &IndexEntry {
        &self.saved.record
    }

    /// Page the entry was found on
    pub fn page_id(&self) -> PageId {
        self.saved.page_id
    }

    /// Take the entry
    pub fn into_entry(self) -> IndexEntry {
        self.saved.record
    }
}

/// Leaf chosen for an insert and the directory entries leading to it
#[derive(Debug, Clone)]
pub(crate) struct InsertTarget {
    pub leaf: PageId,
    pub parents: Vec<ParentPathEntry>,
}

/// Cursor over an R-tree
pub struct RtreeCursor<'t> {
    core: &'t TreeCore,
    query: Mbr,
    mode: QueryMode,
    target_level: u16,
    state: CursorState,
    path: Vec<SearchPathEntry>,
    parents: Vec<ParentPathEntry>,
    track_parents: bool,
    matches: VecDeque<Match>,
    lock_owner: Option<TransactionId>,
    insert_target: Option<(PageId, Option<usize>)>,
    pages_visited: u64,
    _pin: ReaderPin,
}

/// Query predicate on a stored entry at the target level
fn entry_matches(mode: QueryMode, entry: &Mbr, query: &Mbr, core: &TreeCore) -> bool {
    let srs = core.spatial_ref();
    // two zero-area boxes only match on identical coordinates
    let points = area(entry) == 0.0 && area(query) == 0.0;
    match mode {
        QueryMode::Contains if points => equals(entry, query, None),
        QueryMode::Within if points => equals(entry, query, None),
        QueryMode::Contains => contains(entry, query, srs),
        QueryMode::Within => within(entry, query, srs),
        QueryMode::Intersects => intersects(entry, query, srs),
        QueryMode::Disjoint => disjoint(entry, query, srs),
        QueryMode::Equal => equals(entry, query, srs),
        QueryMode::NearestForInsert | QueryMode::GetExactParent(_) => false,
    }
}

/// Whether a directory entry can lead to matches
fn may_contain_matches(mode: QueryMode, entry: &Mbr, query: &Mbr, core: &TreeCore) -> bool {
    let srs = core.spatial_ref();
    match mode {
        QueryMode::Contains | QueryMode::Equal => contains(entry, query, srs),
        QueryMode::Intersects | QueryMode::Within => intersects(entry, query, srs),
        QueryMode::Disjoint => !within(entry, query, srs),
        // ancestors may not cover a page yet while a write is in flight
        QueryMode::GetExactParent(_) | QueryMode::NearestForInsert => true,
    }
}

impl<'t> RtreeCursor<'t> {
    /// Cursor for `mode` over `query`, positioned before the root
    pub fn new(core: &'t TreeCore, mode: QueryMode, query: Mbr) -> Result<Self> {
        query.validate()?;
        let pin = core.store.pin_reader();
        let root = SearchPathEntry {
            page_id: core.root,
            ssn_at_visit: core.ssn.current_ssn(),
            level: None,
            child_page_id: None,
            parent_cursor: None,
        };
        Ok(Self {
            core,
            query,
            mode,
            target_level: 0,
            state: CursorState::Descending,
            path: vec![root],
            parents: Vec::new(),
            track_parents: false,
            matches: VecDeque::new(),
            lock_owner: None,
            insert_target: None,
            pages_visited: 0,
            _pin: pin,
        })
    }

    /// Stop at `level` instead of the leaves
    pub fn with_target_level(mut self, level: u16) -> Self {
        self.target_level = level;
        self
    }

    /// Record traversed directory entries for a later write
    pub fn with_parent_tracking(mut self) -> Self {
        self.track_parents = true;
        self
    }

    /// Place a shared predicate lock on every target page visited
    pub fn with_predicate_lock(mut self, owner: TransactionId) -> Self {
        self.lock_owner = Some(owner);
        self
    }

    /// Current state
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Pages fetched so far
    pub fn pages_visited(&self) -> u64 {
        self.pages_visited
    }

    /// Directory entries from the root down to the one at `from`
    pub fn parent_chain(&self, from: Option<usize>) -> Vec<ParentPathEntry> {
        let mut chain = Vec::new();
        let mut at = from;
        while let Some(idx) = at {
            let entry = &self.parents[idx];
            chain.push(entry.clone());
            at = entry.up;
        }
        chain.reverse();
        chain
    }

    /// Next match, `None` once the tree is exhausted
    pub fn next_match(&mut self) -> Result<Option<Match>> {
        loop {
            if let Some(m) = self.matches.pop_front() {
                return Ok(Some(m));
            }
            if self.state == CursorState::Exhausted {
                return Ok(None);
            }
            self.state = CursorState::Descending;
            if !self.step()? {
                return Ok(None);
            }
        }
    }

    fn step(&mut self) -> Result<bool> {
        let Some(visit) = self.path.pop() else {
            self.state = CursorState::Exhausted;
            return Ok(false);
        };

        let page = match self.core.store.fetch(visit.page_id, LatchMode::Shared) {
            Ok(page) => page,
            // freed under a reader; the id stays unused while it runs
            Err(Error::PageNotFound(id)) if !self.track_parents && id != self.core.root => {
                debug!(page_id = id.0, "queued page no longer exists, skipping");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        self.pages_visited += 1;

        if page.page_id() != visit.page_id {
            error!(expected = visit.page_id.0, found = page.page_id().0, "fetched page has a different id");
            return Err(Error::corruption("page id mismatch", visit.page_id));
        }
        if let Some(level) = visit.level {
            if page.level() != level {
                error!(
                    page_id = visit.page_id.0,
                    expected = level,
                    found = page.level(),
                    via = ?visit.child_page_id,
                    "child page level mismatch"
                );
                return Err(Error::corruption("child page level mismatch", visit.page_id));
            }
        }
        trace!(page_id = visit.page_id.0, level = page.level(), ssn = page.ssn(), "visiting page");

        if page.ssn() > visit.ssn_at_visit {
            if let Some(next) = page.next() {
                self.core.stats.ssn_chase();
                trace!(page_id = visit.page_id.0, next = next.0, "page split since queued, following sibling");
                self.path.push(SearchPathEntry {
                    page_id: next,
                    ssn_at_visit: visit.ssn_at_visit,
                    level: Some(page.level()),
                    child_page_id: visit.child_page_id.or(Some(visit.page_id)),
                    parent_cursor: visit.parent_cursor,
                });
            }
        }

        if page.level() > self.target_level {
            self.visit_branch(&page, &visit)?;
        } else if page.level() == self.target_level {
            self.visit_target(&page, &visit)?;
        }
        Ok(true)
    }

    fn queue_child(&mut self, page: &Page, slot: usize, entry: IndexEntry, increase: f64, visit: &SearchPathEntry, ssn: u64) -> Result<()> {
        let Some(child) = entry.child() else {
            error!(page_id = page.page_id().0, level = page.level(), slot, record = ?entry, "leaf record on a branch page");
            return Err(Error::corruption("leaf record on a branch page", page.page_id()));
        };
        let parent_cursor = if self.track_parents {
            self.parents.push(ParentPathEntry {
                level: page.level(),
                page_id: page.page_id(),
                child_page_id: child,
                mbr_increase: increase,
                saved_cursor: SavedCursor::capture(page, slot, entry),
                up: visit.parent_cursor,
            });
            Some(self.parents.len() - 1)
        } else {
            None
        };
        self.path.push(SearchPathEntry {
            page_id: child,
            ssn_at_visit: ssn,
            level: Some(page.level() - 1),
            child_page_id: Some(child),
            parent_cursor,
        });
        Ok(())
    }

    fn visit_branch(&mut self, page: &Page, visit: &SearchPathEntry) -> Result<()> {
        // sampled under the parent latch; a later split of a child bumps
        // its SSN past this value
        let ssn = self.core.ssn.current_ssn();
        if self.mode == QueryMode::NearestForInsert {
            let (slot, entry, increase) = self.choose_insert_child(page)?;
            return self.queue_child(page, slot, entry, increase, visit, ssn);
        }
        for slot in 0..page.len() {
            let entry = page.entry(slot)?;
            if may_contain_matches(self.mode, entry.mbr(), &self.query, self.core) {
                self.queue_child(page, slot, entry, 0.0, visit, ssn)?;
            }
        }
        Ok(())
    }

    /// Containing entry of least area, else least area increase
    fn choose_insert_child(&self, page: &Page) -> Result<(usize, IndexEntry, f64)> {
        let mut best: Option<(usize, IndexEntry, (bool, f64, f64))> = None;
        for slot in 0..page.len() {
            let entry = page.entry(slot)?;
            let mbr = entry.mbr();
            let rank = if contains(mbr, &self.query, None) {
                (false, area(mbr), 0.0)
            } else {
                (true, area_increase(mbr, &self.query).0, area(mbr))
            };
            let better = match &best {
                None => true,
                Some((_, _, b)) => {
                    rank.0 < b.0 || (rank.0 == b.0 && (rank.1 < b.1 || (rank.1 == b.1 && rank.2 < b.2)))
                }
            };
            if better {
                best = Some((slot, entry, rank));
            }
        }
        match best {
            Some((slot, entry, (grows, key, _))) => Ok((slot, entry, if grows { key } else { 0.0 })),
            None => {
                error!(page_id = page.page_id().0, level = page.level(), "empty branch page on insert descent");
                Err(Error::corruption("empty branch page", page.page_id()))
            }
        }
    }

    fn visit_target(&mut self, page: &Page, visit: &SearchPathEntry) -> Result<()> {
        match self.mode {
            QueryMode::NearestForInsert => {
                self.insert_target = Some((page.page_id(), visit.parent_cursor));
                self.path.clear();
                self.state = CursorState::MatchedLeaf;
            }
            QueryMode::GetExactParent(child) => {
                if let Some(slot) = page.find_child(child)? {
                    let entry = page.entry(slot)?;
                    self.matches.push_back(Match {
                        saved: SavedCursor::capture(page, slot, entry),
                        parent: visit.parent_cursor,
                    });
                    self.path.clear();
                    self.state = CursorState::MatchedInternal;
                }
            }
            mode => {
                if let Some(owner) = self.lock_owner {
                    self.core.locks.place_predicate_lock(owner, page.page_id(), &self.query, PredicateMode::Shared)?;
                }
                let before = self.matches.len();
                for slot in 0..page.len() {
                    let entry = page.entry(slot)?;
                    if entry_matches(mode, entry.mbr(), &self.query, self.core) {
                        self.matches.push_back(Match {
                            saved: SavedCursor::capture(page, slot, entry),
                            parent: visit.parent_cursor,
                        });
                    }
                }
                if self.matches.len() > before {
                    self.state = if page.is_leaf() { CursorState::MatchedLeaf } else { CursorState::MatchedInternal };
                }
            }
        }
        Ok(())
    }
}

impl Iterator for RtreeCursor<'_> {
    type Item = Result<Match>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_match() {
            Ok(Some(m)) => Some(Ok(m)),
            Ok(None) => None,
            Err(e) => {
                self.state = CursorState::Exhausted;
                self.path.clear();
                self.matches.clear();
                Some(Err(e))
            }
        }
    }
}

/// Descend to the leaf that should receive an entry covering `mbr`
pub(crate) fn descend_for_insert(core: &TreeCore, mbr: &Mbr) -> Result<InsertTarget> {
    let mut cursor = RtreeCursor::new(core, QueryMode::NearestForInsert, *mbr)?.with_parent_tracking();
    while cursor.step()? {}
    match cursor.insert_target.take() {
        Some((leaf, parent)) => Ok(InsertTarget { leaf, parents: cursor.parent_chain(parent) }),
        None => Err(Error::corruption("insert descent reached no leaf", core.root)),
    }
}

/// Find a leaf entry and the directory entries leading to it
pub(crate) fn locate_entry(core: &TreeCore, entry: &IndexEntry) -> Result<Option<(SavedCursor, Vec<ParentPathEntry>)>> {
    let mut cursor = RtreeCursor::new(core, QueryMode::Equal, *entry.mbr())?.with_parent_tracking();
    while let Some(m) = cursor.next_match()? {
        if m.entry() == entry {
            let parents = cursor.parent_chain(m.parent);
            return Ok(Some((m.saved, parents)));
        }
    }
    Ok(None)
}

/// Directory entries from the root down to the one referencing `page_id`
///
/// Scans every directory page above `level`. `mbr` is only reported.
pub(crate) fn find_parent_path(core: &TreeCore, page_id: PageId, level: u16, mbr: &Mbr) -> Result<Vec<ParentPathEntry>> {
    if page_id == core.root {
        return Ok(Vec::new());
    }
    let mut cursor = RtreeCursor::new(core, QueryMode::GetExactParent(page_id), *mbr)?
        .with_target_level(level + 1)
        .with_parent_tracking();
    match cursor.next_match()? {
        Some(m) => {
            let mut chain = cursor.parent_chain(m.parent);
            chain.push(ParentPathEntry {
                level: level + 1,
                page_id: m.saved.page_id,
                child_page_id: page_id,
                mbr_increase: 0.0,
                saved_cursor: m.saved,
                up: m.parent,
            });
            Ok(chain)
        }
        None => {
            error!(page_id = page_id.0, level, mbr = ?mbr, "no directory entry references page");
            Err(Error::corruption("page has no parent entry", page_id))
        }
    }
}
