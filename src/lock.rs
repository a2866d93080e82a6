//! Predicate lock coordination
//!
//! Predicate locks are attached to pages and keyed by a region. The index
//! calls the coordinator wherever a page splits, merges or is freed so the
//! locks keep covering the regions they protect.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, PageId, Result, TransactionId};
use crate::mbr::{intersects, Mbr};

/// Predicate lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateMode {
    /// Scan lock held by a reader
    Shared,
    /// Lock held by a writer
    Exclusive,
    /// Check made by an insert, never stored
    InsertIntention,
}

impl PredicateMode {
    fn conflicts_with(self, held: PredicateMode) -> bool {
        match (self, held) {
            (PredicateMode::Shared, PredicateMode::Shared) => false,
            (_, PredicateMode::InsertIntention) => false,
            _ => true,
        }
    }
}

/// Lock coordinator interface
pub trait LockCoordinator: Send + Sync {
    /// Place a lock on `mbr` at `page`, failing on conflict
    fn place_predicate_lock(&self, owner: TransactionId, page: PageId, mbr: &Mbr, mode: PredicateMode) -> Result<()>;

    /// `old` split into `old` and `new`
    fn migrate_predicate_locks_on_split(&self, old: PageId, new: PageId, old_mbr: &Mbr, new_mbr: &Mbr);

    /// `absorbed` merged into `survivor`
    fn migrate_predicate_locks_on_merge(&self, absorbed: PageId, survivor: PageId) {
        let _ = (absorbed, survivor);
    }

    /// `page` was freed
    fn migrate_predicate_locks_on_discard(&self, page: PageId);
}

/// Lock movement caused by a structural change
///
/// Mutation scopes collect these and hand them to the coordinator only
/// once the page changes are committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockMigration {
    /// `old` split into `old` and `new`
    Split {
        /// Page that split
        old: PageId,
        /// New right sibling
        new: PageId,
        /// Region left on `old`
        old_mbr: Mbr,
        /// Region moved to `new`
        new_mbr: Mbr,
    },
    /// `absorbed` merged into `survivor`
    Merge {
        /// Page whose records moved
        absorbed: PageId,
        /// Page that took them
        survivor: PageId,
    },
    /// `page` was freed
    Discard {
        /// Freed page
        page: PageId,
    },
}

impl LockMigration {
    /// Apply the movement to `locks`
    pub fn apply(&self, locks: &dyn LockCoordinator) {
        match *self {
            LockMigration::Split { old, new, old_mbr, new_mbr } => {
                locks.migrate_predicate_locks_on_split(old, new, &old_mbr, &new_mbr)
            }
            LockMigration::Merge { absorbed, survivor } => locks.migrate_predicate_locks_on_merge(absorbed, survivor),
            LockMigration::Discard { page } => locks.migrate_predicate_locks_on_discard(page),
        }
    }
}

/// Coordinator for hosts without predicate locking
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockCoordinator;

impl LockCoordinator for NoopLockCoordinator {
    fn place_predicate_lock(&self, _: TransactionId, _: PageId, _: &Mbr, _: PredicateMode) -> Result<()> {
        Ok(())
    }

    fn migrate_predicate_locks_on_split(&self, _: PageId, _: PageId, _: &Mbr, _: &Mbr) {}

    fn migrate_predicate_locks_on_discard(&self, _: PageId) {}
}

/// Lock held on a page
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredicateLock {
    /// Owning transaction
    pub owner: TransactionId,
    /// Locked region
    pub mbr: Mbr,
    /// Lock mode
    pub mode: PredicateMode,
}

/// In-memory predicate lock table
#[derive(Debug, Default)]
pub struct PredicateLockTable {
    locks: Mutex<HashMap<PageId, Vec<PredicateLock>>>,
}

impl PredicateLockTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks attached to `page`
    pub fn locks_on(&self, page: PageId) -> Vec<PredicateLock> {
        self.locks.lock().get(&page).cloned().unwrap_or_default()
    }

    /// Total number of stored locks
    pub fn len(&self) -> usize {
        self.locks.lock().values().map(Vec::len).sum()
    }

    /// Whether no lock is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every lock of `owner`
    pub fn release_all(&self, owner: TransactionId) {
        let mut locks = self.locks.lock();
        locks.values_mut().for_each(|held| held.retain(|l| l.owner != owner));
        locks.retain(|_, held| !held.is_empty());
    }
}

impl LockCoordinator for PredicateLockTable {
    fn place_predicate_lock(&self, owner: TransactionId, page: PageId, mbr: &Mbr, mode: PredicateMode) -> Result<()> {
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get(&page) {
            let conflict = held
                .iter()
                .find(|l| l.owner != owner && mode.conflicts_with(l.mode) && intersects(&l.mbr, mbr, None));
            if let Some(l) = conflict {
                return Err(Error::LockConflict { page_id: page, holder: l.owner, requester: owner });
            }
        }
        if mode == PredicateMode::InsertIntention {
            return Ok(());
        }
        let held = locks.entry(page).or_default();
        if !held.iter().any(|l| l.owner == owner && l.mode == mode && l.mbr == *mbr) {
            held.push(PredicateLock { owner, mbr: *mbr, mode });
        }
        Ok(())
    }

    fn migrate_predicate_locks_on_split(&self, old: PageId, new: PageId, _old_mbr: &Mbr, new_mbr: &Mbr) {
        let mut locks = self.locks.lock();
        let copied: Vec<PredicateLock> = match locks.get(&old) {
            Some(held) => held.iter().filter(|l| intersects(&l.mbr, new_mbr, None)).copied().collect(),
            None => return,
        };
        if copied.is_empty() {
            return;
        }
        trace!(old = old.0, new = new.0, count = copied.len(), "predicate locks copied to split sibling");
        locks.entry(new).or_default().extend(copied);
    }

    fn migrate_predicate_locks_on_merge(&self, absorbed: PageId, survivor: PageId) {
        let mut locks = self.locks.lock();
        if let Some(moved) = locks.remove(&absorbed) {
            let held = locks.entry(survivor).or_default();
            for lock in moved {
                if !held.contains(&lock) {
                    held.push(lock);
                }
            }
        }
    }

    fn migrate_predicate_locks_on_discard(&self, page: PageId) {
        self.locks.lock().remove(&page);
    }
}
