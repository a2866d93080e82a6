//! Reader registration for page id reuse
//!
//! Readers take no tree latch, so a reader may still have the id of a page
//! queued after a writer freed it. Freed ids are stamped with an epoch and
//! become reusable only once every reader registered before that epoch has
//! finished. Until then a reader fetching the id finds no page at all
//! rather than an unrelated one.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Free epoch stamp
pub type Epoch = u64;

#[derive(Debug, Default)]
struct ReaderState {
    epoch: Epoch,
    // registration epoch -> readers registered at it
    active: BTreeMap<Epoch, usize>,
}

/// Table of running readers
#[derive(Debug, Default)]
pub struct ReaderTable {
    state: Mutex<ReaderState>,
}

impl ReaderTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader until the returned pin drops
    pub fn register(table: &Arc<Self>) -> ReaderPin {
        let mut state = table.state.lock();
        let epoch = state.epoch;
        *state.active.entry(epoch).or_insert(0) += 1;
        ReaderPin { table: Some(Arc::clone(table)), epoch }
    }

    /// Stamp for an id freed now
    pub fn retire(&self) -> Epoch {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.epoch
    }

    /// Registration epoch of the oldest running reader
    pub fn oldest_reader(&self) -> Option<Epoch> {
        self.state.lock().active.keys().next().copied()
    }

    /// Number of running readers
    pub fn reader_count(&self) -> usize {
        self.state.lock().active.values().sum()
    }

    /// Whether no running reader can still hold an id stamped `freed_at`
    pub fn is_reclaimable(&self, freed_at: Epoch) -> bool {
        self.oldest_reader().map_or(true, |oldest| oldest >= freed_at)
    }

    fn release(&self, epoch: Epoch) {
        let mut state = self.state.lock();
        if let Some(count) = state.active.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                state.active.remove(&epoch);
            }
        }
    }
}

/// Registration of one reader
///
/// Stores that never recycle ids hand out detached pins.
#[derive(Debug)]
pub struct ReaderPin {
    table: Option<Arc<ReaderTable>>,
    epoch: Epoch,
}

impl ReaderPin {
    /// Pin not registered anywhere
    pub fn detached() -> Self {
        Self { table: None, epoch: 0 }
    }
}

impl Drop for ReaderPin {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            table.release(self.epoch);
        }
    }
}
