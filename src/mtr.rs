//! Atomic mutation scopes
//!
//! A scope groups the page mutations of one logical operation. It keeps a
//! before-image of every page on first touch and the redo records of each
//! change. Committing hands the records to the store's redo sink; dropping
//! an open scope puts every before-image back and discards pages it
//! created, so no partial split or merge is ever left behind.
//!
//! Predicate lock migrations are deferred the same way: the scope queues
//! them in order and applies them after the redo sink accepted the
//! records, and a rolled back scope discards them.
//!
//! Page handles touched by a scope must be released before the scope is
//! committed or dropped.

use std::collections::HashMap;
use std::mem;

use tracing::{debug, error, warn};

use crate::error::{PageId, Result};
use crate::lock::{LockCoordinator, LockMigration};
use crate::mbr::Mbr;
use crate::page::Page;
use crate::store::{HeaderUpdate, PageStore};

/// Log sequence number
pub type Lsn = u64;

/// Logical redo record
#[derive(Debug, Clone, PartialEq)]
pub enum RedoRecord {
    /// Page allocated
    PageCreate {
        /// New page
        page_id: PageId,
        /// Level it was created at
        level: u16,
    },
    /// Page freed
    PageFree {
        /// Freed page
        page_id: PageId,
    },
    /// Record inserted
    InsertRecord {
        /// Target page
        page_id: PageId,
        /// Slot of the new record
        slot: u16,
        /// Encoded record
        record: Vec<u8>,
    },
    /// Record deleted
    DeleteRecord {
        /// Target page
        page_id: PageId,
        /// Slot before deletion
        slot: u16,
    },
    /// MBR bytes rewritten in place
    UpdateMbr {
        /// Target page
        page_id: PageId,
        /// Record slot
        slot: u16,
        /// New bounding box
        mbr: Mbr,
    },
    /// Record flags replaced
    RecordFlags {
        /// Target page
        page_id: PageId,
        /// Record slot
        slot: u16,
        /// New flag bits
        flags: u8,
    },
    /// Garbage reclaimed
    Reorganize {
        /// Target page
        page_id: PageId,
    },
    /// Byte-identical copy of another page's records
    CopyPage {
        /// Page copied from
        src: PageId,
        /// Page copied to
        dst: PageId,
    },
    /// Records moved between pages
    MoveRecords {
        /// Page records left
        src: PageId,
        /// Page records joined
        dst: PageId,
        /// Number of records
        count: u16,
    },
    /// Header field changed
    Header {
        /// Target page
        page_id: PageId,
        /// The change
        update: HeaderUpdate,
    },
    /// Every record removed
    Clear {
        /// Target page
        page_id: PageId,
    },
}

/// Atomic mutation scope
pub struct MutationScope<'a> {
    store: &'a dyn PageStore,
    locks: Option<&'a dyn LockCoordinator>,
    records: Vec<RedoRecord>,
    migrations: Vec<LockMigration>,
    // None marks a page created within the scope
    images: HashMap<PageId, Option<Page>>,
    open: bool,
}

impl<'a> MutationScope<'a> {
    /// Open a scope over `store` that drops lock migrations
    pub fn begin(store: &'a dyn PageStore) -> Self {
        Self { store, locks: None, records: Vec::new(), migrations: Vec::new(), images: HashMap::new(), open: true }
    }

    /// Open a scope that applies lock migrations to `locks` on commit
    pub fn with_locks(store: &'a dyn PageStore, locks: &'a dyn LockCoordinator) -> Self {
        Self {
            store,
            locks: Some(locks),
            records: Vec::new(),
            migrations: Vec::new(),
            images: HashMap::new(),
            open: true,
        }
    }

    /// Keep a before-image of `page` unless one is already held
    pub fn capture(&mut self, page: &Page) {
        self.images.entry(page.page_id()).or_insert_with(|| Some(page.clone()));
    }

    /// Record that `page_id` was allocated by this scope
    pub fn note_created(&mut self, page_id: PageId) {
        self.images.entry(page_id).or_insert(None);
    }

    /// Append a redo record
    pub fn log(&mut self, record: RedoRecord) {
        self.records.push(record);
    }

    /// Queue a lock migration for commit
    pub fn defer_lock_migration(&mut self, migration: LockMigration) {
        self.migrations.push(migration);
    }

    /// Redo records so far
    pub fn records(&self) -> &[RedoRecord] {
        &self.records
    }

    /// Whether `page_id` has been touched
    pub fn touched(&self, page_id: PageId) -> bool {
        self.images.contains_key(&page_id)
    }

    /// Hand the records to the redo sink
    ///
    /// When the sink fails the scope stays open and rolls back on drop.
    pub fn commit(mut self) -> Result<Lsn> {
        let records = mem::take(&mut self.records);
        let count = records.len();
        let lsn = self.store.append_redo(records)?;
        self.images.clear();
        self.open = false;
        let migrations = mem::take(&mut self.migrations);
        if let Some(locks) = self.locks {
            migrations.iter().for_each(|m| m.apply(locks));
        }
        debug!(records = count, migrations = migrations.len(), lsn, "mutation scope committed");
        Ok(lsn)
    }

    /// Undo every mutation made in the scope
    pub fn rollback(mut self) -> Result<()> {
        self.open = false;
        self.restore_images()
    }

    fn restore_images(&mut self) -> Result<()> {
        self.records.clear();
        if !self.migrations.is_empty() {
            debug!(count = self.migrations.len(), "lock migrations discarded with rolled back scope");
            self.migrations.clear();
        }
        for (page_id, image) in self.images.drain() {
            match image {
                Some(page) => self.store.restore_page(page)?,
                None => self.store.discard_page(page_id)?,
            }
        }
        Ok(())
    }
}

impl Drop for MutationScope<'_> {
    fn drop(&mut self) {
        if !self.open || self.images.is_empty() {
            return;
        }
        warn!(pages = self.images.len(), "mutation scope dropped uncommitted, rolling back");
        if let Err(e) = self.restore_images() {
            error!(error = %e, "rollback of mutation scope failed");
        }
    }
}
