//! Structural invariant checks
//!
//! Walks the tree level by level with shared latches. Meant for tests and
//! offline checks; concurrent writers must be excluded by the caller.

use std::collections::{HashMap, HashSet};

use tracing::error;

use crate::entry::RecordFlags;
use crate::error::{Error, PageId, Result};
use crate::mbr::Mbr;
use crate::store::LatchMode;
use crate::tree::TreeCore;

/// Summary of a validated tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of levels
    pub height: u16,
    /// Pages reachable from the root
    pub pages: u64,
    /// Leaf pages
    pub leaf_pages: u64,
    /// Leaf entries
    pub entries: u64,
}

fn violation(page_id: PageId, details: String) -> Error {
    error!(page_id = page_id.0, %details, "tree invariant violated");
    Error::corruption(details, page_id)
}

struct LevelPage {
    page_id: PageId,
    prev: Option<PageId>,
    next: Option<PageId>,
}

/// Check that every directory entry's MBR is exactly the union of its
/// child page, levels decrease by one, sibling chains are consistent, SSNs
/// are bounded by the tree SSN and min-record markers sit where they must
pub fn validate_mbr_containment(core: &TreeCore) -> Result<TreeShape> {
    let current_ssn = core.ssn.current_ssn();
    let mut shape = TreeShape::default();
    let mut seen: HashSet<PageId> = HashSet::new();
    // page, expected level, expected MBR from the parent entry
    let mut frontier: Vec<(PageId, Option<u16>, Option<Mbr>)> = vec![(core.root, None, None)];

    while !frontier.is_empty() {
        let mut next_frontier = Vec::new();
        let mut level_pages: Vec<LevelPage> = Vec::new();

        for (page_id, level, expected_mbr) in frontier {
            if !seen.insert(page_id) {
                return Err(violation(page_id, "page referenced twice".into()));
            }
            let page = core.store.fetch(page_id, LatchMode::Shared)?;
            let is_root = page_id == core.root;

            if is_root != page.is_root() {
                return Err(violation(page_id, format!("root flag is {} on a page that is root={}", page.is_root(), is_root)));
            }
            if let Some(level) = level {
                if page.level() != level {
                    return Err(violation(page_id, format!("level {} where {} was expected", page.level(), level)));
                }
            } else {
                shape.height = page.level() + 1;
            }
            if page.ssn() > current_ssn {
                return Err(violation(page_id, format!("page SSN {} above tree SSN {}", page.ssn(), current_ssn)));
            }
            if page.is_empty() && !(is_root && page.is_leaf()) {
                return Err(violation(page_id, "empty page in the tree".into()));
            }
            if let Some(expected) = expected_mbr {
                let actual = page.compute_mbr()?;
                if actual != Some(expected) {
                    return Err(violation(
                        page_id,
                        format!("parent entry MBR {:?} differs from page union {:?}", expected, actual),
                    ));
                }
            }

            let leftmost = page.prev().is_none();
            for slot in 0..page.len() {
                let flags = page.record_flags(slot)?;
                if flags.contains(RecordFlags::NODE_PTR) == page.is_leaf() {
                    return Err(violation(page_id, format!("record {} has the wrong kind for level {}", slot, page.level())));
                }
                let wants_min = !page.is_leaf() && leftmost && slot == 0;
                if flags.contains(RecordFlags::MIN_REC) != wants_min {
                    return Err(violation(page_id, format!("min-record marker misplaced at slot {}", slot)));
                }
                if page.is_leaf() {
                    continue;
                }
                let entry = page.entry(slot)?;
                if let Some(child) = entry.child() {
                    next_frontier.push((child, Some(page.level() - 1), Some(*entry.mbr())));
                }
            }

            shape.pages += 1;
            if page.is_leaf() {
                shape.leaf_pages += 1;
                shape.entries += page.len() as u64;
            }
            level_pages.push(LevelPage { page_id, prev: page.prev(), next: page.next() });
        }

        check_sibling_chain(&level_pages)?;
        frontier = next_frontier;
    }
    Ok(shape)
}

/// The pages of one level must form a single doubly linked chain
fn check_sibling_chain(pages: &[LevelPage]) -> Result<()> {
    let by_id: HashMap<PageId, &LevelPage> = pages.iter().map(|p| (p.page_id, p)).collect();
    let heads: Vec<&LevelPage> = pages.iter().filter(|p| p.prev.is_none()).collect();
    let [head] = heads.as_slice() else {
        let page_id = pages.first().map_or(PageId(0), |p| p.page_id);
        return Err(violation(page_id, format!("level has {} leftmost pages", heads.len())));
    };

    let mut visited = 1;
    let mut at = *head;
    while let Some(next) = at.next {
        let Some(page) = by_id.get(&next) else {
            return Err(violation(at.page_id, format!("right link to page {} outside the level", next)));
        };
        if page.prev != Some(at.page_id) {
            return Err(violation(next, format!("left link {:?} does not match {}", page.prev, at.page_id)));
        }
        visited += 1;
        if visited > pages.len() {
            return Err(violation(next, "sibling chain loops".into()));
        }
        at = page;
    }
    if visited != pages.len() {
        return Err(violation(head.page_id, format!("sibling chain covers {} of {} pages", visited, pages.len())));
    }
    Ok(())
}
