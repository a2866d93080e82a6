//! Tree configuration and builder

use std::sync::Arc;

use crate::comparator::{compare_fn, CompareFn, Comparator, LexicographicComparator};
use crate::error::{Error, PageId, Result};
use crate::lock::{LockCoordinator, NoopLockCoordinator};
use crate::mbr::SpatialRef;
use crate::page::{validate_page_size, DEFAULT_PAGE_SIZE};
use crate::store::{MemPageStore, PageStore};
use crate::tree::RTree;

/// Default minimum fill of each split half, as a percentage
pub const DEFAULT_MIN_FILL_PERCENT: usize = 40;

/// Default occupancy below which a page is merged with a sibling
pub const DEFAULT_MERGE_THRESHOLD_PERCENT: usize = 25;

/// Default bound on split retries
pub const DEFAULT_MAX_SPLIT_RETRIES: u32 = 4;

/// Default page limit of in-memory stores
pub const DEFAULT_MAX_PAGES: u64 = 1 << 20;

/// Tree configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfig {
    /// Page size in bytes
    pub page_size: usize,
    /// Minimum fill of each split half, percent of usable space
    pub min_fill_percent: usize,
    /// Occupancy below which a page is merged, percent
    pub merge_threshold_percent: usize,
    /// Bound on split retries for one insert
    pub max_split_retries: u32,
    /// Page limit for stores created by the builder
    pub max_pages: u64,
    /// Tolerance for geometric comparisons, exact when `None`
    pub spatial_ref: Option<SpatialRef>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_fill_percent: DEFAULT_MIN_FILL_PERCENT,
            merge_threshold_percent: DEFAULT_MERGE_THRESHOLD_PERCENT,
            max_split_retries: DEFAULT_MAX_SPLIT_RETRIES,
            max_pages: DEFAULT_MAX_PAGES,
            spatial_ref: None,
        }
    }
}

impl TreeConfig {
    /// Reject settings the tree cannot work with
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if !(10..=50).contains(&self.min_fill_percent) {
            return Err(Error::InvalidParameter("min_fill_percent must be between 10 and 50"));
        }
        if self.merge_threshold_percent > 50 {
            return Err(Error::InvalidParameter("merge_threshold_percent must be at most 50"));
        }
        if self.max_split_retries == 0 {
            return Err(Error::InvalidParameter("max_split_retries must be at least 1"));
        }
        if self.max_pages == 0 {
            return Err(Error::InvalidParameter("max_pages must be at least 1"));
        }
        if let Some(srs) = &self.spatial_ref {
            srs.validate()?;
        }
        Ok(())
    }
}

/// Builder for [`RTree`]
pub struct TreeBuilder {
    config: TreeConfig,
    cmp: CompareFn,
    locks: Arc<dyn LockCoordinator>,
}

impl TreeBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            config: TreeConfig::default(),
            cmp: compare_fn::<LexicographicComparator>(),
            locks: Arc::new(NoopLockCoordinator),
        }
    }

    /// Start from an existing configuration
    pub fn with_config(config: TreeConfig) -> Self {
        Self { config, ..Self::new() }
    }

    /// Set the page size
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the minimum fill of each split half
    pub fn min_fill_percent(mut self, percent: usize) -> Self {
        self.config.min_fill_percent = percent;
        self
    }

    /// Set the merge threshold
    pub fn merge_threshold_percent(mut self, percent: usize) -> Self {
        self.config.merge_threshold_percent = percent;
        self
    }

    /// Set the bound on split retries
    pub fn max_split_retries(mut self, retries: u32) -> Self {
        self.config.max_split_retries = retries;
        self
    }

    /// Set the page limit of stores created by [`TreeBuilder::in_memory`]
    pub fn max_pages(mut self, pages: u64) -> Self {
        self.config.max_pages = pages;
        self
    }

    /// Compare with a tolerance
    pub fn spatial_ref(mut self, srs: SpatialRef) -> Self {
        self.config.spatial_ref = Some(srs);
        self
    }

    /// Order payloads with `C`
    pub fn comparator<C: Comparator>(mut self) -> Self {
        self.cmp = compare_fn::<C>();
        self
    }

    /// Use a predicate lock coordinator
    pub fn lock_coordinator(mut self, locks: Arc<dyn LockCoordinator>) -> Self {
        self.locks = locks;
        self
    }

    /// Configuration built so far
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Create an empty tree in `store`
    pub fn create(self, store: Arc<dyn PageStore>) -> Result<RTree> {
        RTree::create_with(store, self.locks, self.config, self.cmp)
    }

    /// Open the tree rooted at `root` in `store`
    pub fn open(self, store: Arc<dyn PageStore>, root: PageId) -> Result<RTree> {
        RTree::open_with(store, self.locks, self.config, self.cmp, root)
    }

    /// Create an empty tree in a fresh [`MemPageStore`]
    pub fn in_memory(self) -> Result<RTree> {
        self.config.validate()?;
        let store = MemPageStore::with_max_pages(self.config.page_size, self.config.max_pages)?;
        self.create(Arc::new(store))
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
