//! Split sequence numbers

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Split sequence number
pub type Ssn = u64;

/// Tree-wide SSN counter
///
/// Only structural writers advance it, under the exclusive tree latch.
/// Readers sample it when queueing child pages.
#[derive(Debug)]
pub struct SsnCounter {
    current: CachePadded<AtomicU64>,
}

impl SsnCounter {
    /// Counter starting at `start`
    pub fn new(start: Ssn) -> Self {
        Self { current: CachePadded::new(AtomicU64::new(start)) }
    }

    /// Advance the counter and return the new value
    pub fn next_ssn(&self) -> Ssn {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Latest value handed out
    pub fn current_ssn(&self) -> Ssn {
        self.current.load(Ordering::Acquire)
    }
}

impl Default for SsnCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_monotonic() {
        let ssn = SsnCounter::new(5);
        assert_eq!(ssn.current_ssn(), 5);
        assert_eq!(ssn.next_ssn(), 6);
        assert_eq!(ssn.current_ssn(), 6);
        assert_eq!(ssn.next_ssn(), 7);
    }

    #[test]
    fn test_concurrent_next_is_unique() {
        let ssn = Arc::new(SsnCounter::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ssn = Arc::clone(&ssn);
                thread::spawn(move || (0..1000).map(|_| ssn.next_ssn()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<Ssn> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(ssn.current_ssn(), 4000);
    }
}
