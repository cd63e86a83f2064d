//! Run-length-encoded map from a start index to a run length, used for the
//! FAT/exFAT free-cluster map and the directory free-slot map.
//!
//! Invariants: runs are maximal (no two entries are adjacent), disjoint,
//! and every free index appears in exactly one run.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunMap {
    // start -> length
    runs: BTreeMap<u32, u32>,
}

impl RunMap {
    pub fn new() -> Self {
        Self { runs: BTreeMap::new() }
    }

    /// One contiguous run covering `[start, start+len)`.
    pub fn single(start: u32, len: u32) -> Self {
        let mut m = Self::new();
        if len > 0 {
            m.runs.insert(start, len);
        }
        m
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn total_len(&self) -> u64 {
        self.runs.values().map(|&l| l as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.runs.iter().map(|(&s, &l)| (s, l))
    }

    /// Runs in ascending start order whose start is >= `near`, followed by the
    /// rest (used by the allocator's "prefer runs at or after `near`" policy).
    pub fn runs_from(&self, near: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.runs
            .range(near..)
            .chain(self.runs.range(..near))
            .map(|(&s, &l)| (s, l))
    }

    /// Insert a free run, merging with adjacent runs on either side.
    pub fn insert(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }

        let mut new_start = start;
        let mut new_len = len;

        // Merge with a preceding run that ends exactly at `start`.
        if let Some((&prev_start, &prev_len)) = self.runs.range(..start).next_back() {
            if prev_start as u64 + prev_len as u64 == start as u64 {
                new_start = prev_start;
                new_len += prev_len;
                self.runs.remove(&prev_start);
            }
        }

        // Merge with a following run that starts exactly where this one ends.
        let end = new_start as u64 + new_len as u64;
        if let Some((&next_start, &next_len)) = self.runs.range(start..).next() {
            if next_start as u64 == end {
                new_len += next_len;
                self.runs.remove(&next_start);
            }
        }

        self.runs.insert(new_start, new_len);
    }

    /// Remove `len` entries starting at `start` from whichever run(s) contain
    /// them. Panics (a caller bug) if the range isn't entirely free.
    pub fn remove(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }

        let (&run_start, &run_len) = self
            .runs
            .range(..=start)
            .next_back()
            .filter(|&(&s, &l)| start as u64 + len as u64 <= s as u64 + l as u64)
            .expect("remove() range must be entirely within one free run");

        self.runs.remove(&run_start);

        let head = start - run_start;
        if head > 0 {
            self.runs.insert(run_start, head);
        }

        let tail_start = start + len;
        let tail_len = (run_start + run_len) - tail_start;
        if tail_len > 0 {
            self.runs.insert(tail_start, tail_len);
        }
    }

    /// Best-fit: the shortest run that is `>= requested`. Falls back to the
    /// longest available run if none is long enough.
    pub fn best_fit(&self, requested: u32, near: u32) -> Option<(u32, u32)> {
        if requested == 0 {
            return None;
        }

        let mut best_exact: Option<(u32, u32)> = None;
        let mut largest: Option<(u32, u32)> = None;

        for (start, len) in self.runs_from(near) {
            if len >= requested {
                match best_exact {
                    Some((_, best_len)) if best_len <= len => {}
                    _ => best_exact = Some((start, len)),
                }
            }
            match largest {
                Some((_, largest_len)) if largest_len >= len => {}
                _ => largest = Some((start, len)),
            }
        }

        best_exact.or(largest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_adjacent_runs() {
        let mut m = RunMap::new();
        m.insert(10, 5);
        m.insert(15, 3);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![(10, 8)]);

        m.insert(5, 5);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![(5, 13)]);
    }

    #[test]
    fn remove_splits_run() {
        let mut m = RunMap::single(2, 20);
        m.remove(10, 3);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![(2, 8), (13, 9)]);
    }

    #[test]
    fn best_fit_prefers_shortest_sufficient_run() {
        // free map {2:5, 10:3, 20:20}, request 12 clusters: only the third run fits.
        let mut m = RunMap::new();
        m.insert(2, 5);
        m.insert(10, 3);
        m.insert(20, 20);

        let (start, len) = m.best_fit(12, 0).unwrap();
        assert_eq!((start, len), (20, 20));
    }
}
