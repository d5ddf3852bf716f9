//! Bounded, impact-ranked histogram of file sizes.

use std::collections::HashMap;

/// One size class: a file size and how many files of that size were seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEntry {
    pub size: u64,
    pub count: u64,
}

impl SizeEntry {
    /// Upper bound on bytes reclaimable from this class: size × count,
    /// saturating so pathological trees rank maximal instead of wrapping.
    pub fn impact(&self) -> u64 {
        self.size.saturating_mul(self.count)
    }
}

/// Bounded map from file size to occurrence count.
///
/// When an insert pushes the map past capacity, the lowest-impact tenth of
/// the entries is evicted in one batch, amortizing eviction cost across
/// roughly `capacity / 10` subsequent inserts. Impact (size × count) is the
/// eviction key because it is what pass 2 ranks against: a count-only key
/// would favor hordes of tiny files, a size-only key one-off huge files
/// with nothing to dedup against.
#[derive(Debug)]
pub struct SizeMap {
    entries: HashMap<u64, u64>,
    max_entries: usize,
}

impl SizeMap {
    /// Creates a histogram holding at most `max_entries` distinct sizes.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_entries),
            max_entries,
        }
    }

    /// Records one file of the given size.
    pub fn add(&mut self, size: u64) {
        *self.entries.entry(size).or_insert(0) += 1;
        if self.entries.len() > self.max_entries {
            self.evict();
        }
    }

    /// Number of distinct sizes currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `n` most impactful size classes holding at least two files,
    /// impact-descending. Classes with a single file are never returned; one
    /// file has nothing to dedup against.
    pub fn top_n(&self, n: usize) -> Vec<SizeEntry> {
        let mut candidates: Vec<SizeEntry> = self
            .entries
            .iter()
            .filter(|&(_, &count)| count >= 2)
            .map(|(&size, &count)| SizeEntry { size, count })
            .collect();

        // Size as secondary key keeps the ordering deterministic.
        candidates
            .sort_unstable_by(|a, b| b.impact().cmp(&a.impact()).then(b.size.cmp(&a.size)));
        candidates.truncate(n);
        candidates
    }

    /// Drops the lowest-impact tenth of the map (at least one entry).
    fn evict(&mut self) {
        let batch = (self.max_entries / 10).max(1).min(self.entries.len());

        let mut snapshot: Vec<(u64, u64)> = self
            .entries
            .iter()
            .map(|(&size, &count)| (size, size.saturating_mul(count)))
            .collect();

        if batch < snapshot.len() {
            snapshot.select_nth_unstable_by_key(batch - 1, |&(_, impact)| impact);
        }
        for &(size, _) in &snapshot[..batch] {
            self.entries.remove(&size);
        }
    }
}
