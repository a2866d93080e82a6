//! Error types for zerodb-rtree

use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

use crate::store::LatchMode;

/// The main error type for R-tree operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Index structure corruption detected
    #[error("Corruption detected: {details}")]
    Corruption {
        /// Description of the corruption
        details: String,
        /// Page where corruption was detected
        page_id: Option<PageId>,
    },

    /// Page not found in the page store
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    /// A record does not fit in the page without a split
    #[error("Page {page_id} full: {needed} bytes needed, {available} available")]
    PageFull {
        /// Page that rejected the record
        page_id: PageId,
        /// Bytes the record needs, slot included
        needed: usize,
        /// Free bytes, fragmented space included
        available: usize,
    },

    /// The page store cannot allocate another page
    #[error("Map full: page limit of {max_pages} reached")]
    MapFull {
        /// Configured page limit of the store
        max_pages: u64,
    },

    /// Malformed bounding box
    #[error("Invalid MBR: {0}")]
    InvalidMbr(Cow<'static, str>),

    /// A predicate lock request conflicts with a lock held by another transaction
    #[error("Predicate lock conflict on page {page_id}: held by {holder}, requested by {requester}")]
    LockConflict {
        /// Page the lock is attached to
        page_id: PageId,
        /// Transaction holding the conflicting lock
        holder: TransactionId,
        /// Transaction whose request failed
        requester: TransactionId,
    },

    /// A page was accessed with a weaker latch than the operation requires
    #[error("Page {page_id} latched {held:?}, {wanted:?} required")]
    Latch {
        /// Page being accessed
        page_id: PageId,
        /// Latch currently held
        held: LatchMode,
        /// Latch required
        wanted: LatchMode,
    },

    /// A node split kept failing to place the pending entry
    #[error("Split of page {page_id} did not converge after {attempts} attempts")]
    SplitExhausted {
        /// Page whose split was abandoned
        page_id: PageId,
        /// Split attempts made
        attempts: u32,
    },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Decoding error
    #[error("Decoding error: {0}")]
    Decoding(Cow<'static, str>),
}

impl Error {
    /// Build a corruption error for a page
    pub fn corruption(details: impl Into<String>, page_id: PageId) -> Self {
        Error::Corruption { details: details.into(), page_id: Some(page_id) }
    }

    /// Whether the engine resolves this condition itself (reorganize, split, retry)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PageFull { .. })
    }

    /// Whether this error signals a structurally damaged index
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. } | Error::SplitExhausted { .. })
    }
}

/// Page identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, used as predicate lock owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type alias for R-tree operations
pub type Result<T> = std::result::Result<T, Error>;
