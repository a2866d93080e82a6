//! Concurrent paged R-tree
//!
//! A spatial index over fixed-size slotted pages. Leaf pages hold
//! `(Mbr, row locator)` entries, branch pages hold the bounding box of each
//! child page. Readers run without a tree-wide latch and detect concurrent
//! splits through per-page split sequence numbers; writers are serialized
//! by a tree latch and apply every structural change inside a
//! [`mtr::MutationScope`] that can be logged or rolled back as a unit.
//!
//! ```
//! use zerodb_rtree::{Mbr, QueryMode, TransactionId, TreeBuilder};
//!
//! let tree = TreeBuilder::new().page_size(1024).in_memory()?;
//! tree.insert(TransactionId(1), Mbr::rect(0.0, 0.0, 1.0, 1.0), b"row-1".to_vec())?;
//! let found = tree.search(QueryMode::Intersects, &Mbr::rect(0.5, 0.5, 2.0, 2.0))?;
//! assert_eq!(found.len(), 1);
//! # Ok::<(), zerodb_rtree::Error>(())
//! ```

#![warn(missing_docs)]

pub mod comparator;
pub mod config;
pub mod cursor;
pub mod entry;
pub mod error;
pub mod estimate;
pub mod lock;
pub mod mbr;
pub mod mtr;
pub mod page;
pub mod path;
pub mod reader;
pub mod split;
pub mod ssn;
pub mod store;
pub mod tree;
pub mod validate;

mod node_split;
mod parent;

// Re-exports
pub use comparator::{Comparator, LexicographicComparator, LittleEndianComparator, NumericComparator};
pub use config::{TreeBuilder, TreeConfig};
pub use cursor::{CursorState, Match, QueryMode, RtreeCursor};
pub use entry::{IndexEntry, RecordFlags};
pub use error::{Error, PageId, Result, TransactionId};
pub use estimate::RowEstimate;
pub use lock::{LockCoordinator, NoopLockCoordinator, PredicateLockTable, PredicateMode};
pub use mbr::{Mbr, SpatialRef};
pub use page::{Page, PageFlags, DEFAULT_PAGE_SIZE};
pub use reader::{ReaderPin, ReaderTable};
pub use ssn::Ssn;
pub use store::{LatchMode, MemPageStore, PageStore};
pub use tree::{RTree, TreeStats};
pub use validate::TreeShape;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
