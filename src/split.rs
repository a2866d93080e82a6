//! Quadratic node split on a byte budget
//!
//! Pure partitioning of an overflowing page's entries plus the pending one
//! into two groups. Seeds are the pair that wastes the most area when
//! joined; remaining entries are picked by largest preference difference
//! and assigned to the group that grows least. Every group must reach the
//! minimum byte budget, which forces assignment once one group can only
//! just make it with what is left.

use crate::error::{Error, Result};
use crate::mbr::{area, area_increase, join, Mbr};

/// Split input for one entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitInput {
    /// Bounding box of the entry
    pub mbr: Mbr,
    /// Bytes the entry occupies on a page, slot included
    pub bytes: usize,
}

/// Group tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    /// Stays on the split page
    First,
    /// Moves to the new sibling
    Second,
}

/// Result of [`split_entries`]
#[derive(Debug, Clone, PartialEq)]
pub struct SplitGroups {
    /// Group of each input, in input order
    pub tags: Vec<Group>,
    /// Members of the first group
    pub first_count: usize,
    /// Members of the second group
    pub second_count: usize,
    /// Bytes of the first group
    pub first_bytes: usize,
    /// Bytes of the second group
    pub second_bytes: usize,
    /// Union of the first group
    pub first_mbr: Mbr,
    /// Union of the second group
    pub second_mbr: Mbr,
}

impl SplitGroups {
    /// Group of input `index`
    pub fn group_of(&self, index: usize) -> Group {
        self.tags[index]
    }

    /// Input indices of `group`, ascending
    pub fn members(&self, group: Group) -> impl Iterator<Item = usize> + '_ {
        self.tags.iter().enumerate().filter(move |(_, g)| **g == group).map(|(i, _)| i)
    }
}

/// Minimum group size in bytes for a split
///
/// `min_fill_percent` of the usable page space, raised so neither group
/// can outgrow a page, then clamped so the split of `total_bytes` whose
/// largest item is `max_item` is always satisfiable.
pub fn min_split_bytes(usable: usize, min_fill_percent: usize, total_bytes: usize, max_item: usize) -> usize {
    let requested = (usable * min_fill_percent / 100).max(total_bytes.saturating_sub(usable));
    let feasible = (total_bytes + 1).saturating_sub(max_item) / 2;
    requested.min(feasible)
}

struct Side {
    mbr: Mbr,
    bytes: usize,
    count: usize,
}

impl Side {
    fn seed(input: &SplitInput) -> Self {
        Self { mbr: input.mbr, bytes: input.bytes, count: 1 }
    }

    fn add(&mut self, input: &SplitInput) {
        self.mbr = join(&self.mbr, &input.mbr);
        self.bytes += input.bytes;
        self.count += 1;
    }
}

fn pick_seeds(items: &[SplitInput]) -> (usize, usize) {
    let mut seeds = (0, 1);
    let mut worst = f64::NEG_INFINITY;
    for i in 0..items.len() {
        for j in i + 1..items.len() {
            let (a, b) = (&items[i].mbr, &items[j].mbr);
            let waste = area(&join(a, b)) - area(a) - area(b);
            if waste > worst {
                worst = waste;
                seeds = (i, j);
            }
        }
    }
    seeds
}

fn preferred(inc: (f64, f64), first: &Side, second: &Side) -> Group {
    if inc.0 != inc.1 {
        return if inc.0 < inc.1 { Group::First } else { Group::Second };
    }
    let (a1, a2) = (area(&first.mbr), area(&second.mbr));
    if a1 != a2 {
        return if a1 < a2 { Group::First } else { Group::Second };
    }
    if second.count < first.count {
        Group::Second
    } else {
        Group::First
    }
}

/// Partition `items` into two groups of at least `min_bytes` each
///
/// Deterministic for a given input order. Fails only when fewer than two
/// items are given.
pub fn split_entries(items: &[SplitInput], min_bytes: usize) -> Result<SplitGroups> {
    if items.len() < 2 {
        return Err(Error::InvalidParameter("split needs at least two entries"));
    }

    let (s1, s2) = pick_seeds(items);
    let mut tags: Vec<Option<Group>> = vec![None; items.len()];
    tags[s1] = Some(Group::First);
    tags[s2] = Some(Group::Second);
    let mut first = Side::seed(&items[s1]);
    let mut second = Side::seed(&items[s2]);
    let mut remaining: usize = items.iter().map(|i| i.bytes).sum::<usize>() - first.bytes - second.bytes;
    let mut unassigned = items.len() - 2;

    while unassigned > 0 {
        let forced = if first.bytes + remaining <= min_bytes {
            Some(Group::First)
        } else if second.bytes + remaining <= min_bytes {
            Some(Group::Second)
        } else {
            None
        };
        if let Some(group) = forced {
            for (i, tag) in tags.iter_mut().enumerate() {
                if tag.is_none() {
                    *tag = Some(group);
                    match group {
                        Group::First => first.add(&items[i]),
                        Group::Second => second.add(&items[i]),
                    }
                }
            }
            break;
        }

        let mut next = None;
        let mut max_diff = f64::NEG_INFINITY;
        for (i, item) in items.iter().enumerate() {
            if tags[i].is_some() {
                continue;
            }
            let inc1 = area_increase(&first.mbr, &item.mbr).0;
            let inc2 = area_increase(&second.mbr, &item.mbr).0;
            let diff = (inc1 - inc2).abs();
            if diff > max_diff {
                max_diff = diff;
                next = Some((i, (inc1, inc2)));
            }
        }
        let Some((i, inc)) = next else { break };

        let bytes = items[i].bytes;
        let group = match preferred(inc, &first, &second) {
            // taking this entry would leave the other group short
            Group::First if second.bytes + remaining - bytes < min_bytes => Group::Second,
            Group::Second if first.bytes + remaining - bytes < min_bytes => Group::First,
            group => group,
        };
        match group {
            Group::First => first.add(&items[i]),
            Group::Second => second.add(&items[i]),
        }
        tags[i] = Some(group);
        remaining -= bytes;
        unassigned -= 1;
    }

    Ok(SplitGroups {
        tags: tags.into_iter().map(|t| t.unwrap_or(Group::First)).collect(),
        first_count: first.count,
        second_count: second.count,
        first_bytes: first.bytes,
        second_bytes: second.bytes,
        first_mbr: first.mbr,
        second_mbr: second.mbr,
    })
}
