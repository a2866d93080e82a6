//! Row locator ordering
//!
//! Row locators are opaque to the index. Entries with identical MBRs are
//! ordered by their locator so a page has one deterministic slot for every
//! entry and an exact entry can be found again after its page changed.
//! Hosts pick the order that matches how they encode locators.

use std::cmp::Ordering;

/// Three-way comparison over raw row locators
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// Order over encoded row locators
pub trait Comparator: Send + Sync + 'static {
    /// Compare two row locators
    fn compare(a: &[u8], b: &[u8]) -> Ordering;
}

/// Byte-wise order, the default
pub struct LexicographicComparator;

impl Comparator for LexicographicComparator {
    #[inline(always)]
    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Row ids stored as big-endian unsigned integers of any width
pub struct NumericComparator;

impl Comparator for NumericComparator {
    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        fn significant(s: &[u8]) -> &[u8] {
            let zeros = s.iter().take_while(|&&b| b == 0).count();
            &s[zeros..]
        }
        let (a, b) = (significant(a), significant(b));
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

/// Row ids stored as little-endian unsigned integers of any width
pub struct LittleEndianComparator;

impl Comparator for LittleEndianComparator {
    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        fn significant(s: &[u8]) -> &[u8] {
            let zeros = s.iter().rev().take_while(|&&b| b == 0).count();
            &s[..s.len() - zeros]
        }
        let (a, b) = (significant(a), significant(b));
        a.len().cmp(&b.len()).then_with(|| a.iter().rev().cmp(b.iter().rev()))
    }
}

/// Function pointer for a comparator type
pub fn compare_fn<C: Comparator>() -> CompareFn {
    C::compare
}
