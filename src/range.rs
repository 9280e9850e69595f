//! Set of byte intervals available in a cached file.
//!
//! Intervals are half-open `[start, end)` over u64 offsets and kept
//! normalized: sorted by start, pairwise disjoint, never touching. `add`
//! absorbs every interval it overlaps or abuts, so lookups stay a simple
//! scan over a short vector.

#[derive(Debug, Default)]
pub struct RangeSet {
    intervals: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `[start, end)`, merging with any interval it intersects or
    /// touches. `start == end` is a no-op.
    pub fn add(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        // First interval that can merge (its end reaches start), then every
        // interval whose start does not pass end.
        let mut lo = 0;
        while lo < self.intervals.len() && self.intervals[lo].1 < start {
            lo += 1;
        }
        let mut new_start = start;
        let mut new_end = end;
        let mut hi = lo;
        while hi < self.intervals.len() && self.intervals[hi].0 <= end {
            new_start = new_start.min(self.intervals[hi].0);
            new_end = new_end.max(self.intervals[hi].1);
            hi += 1;
        }
        self.intervals.splice(lo..hi, [(new_start, new_end)]);
    }

    /// True iff some stored interval encloses `[start, end)`.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        self.intervals
            .iter()
            .any(|&(s, e)| s <= start && end <= e)
    }

    pub fn count(&self) -> usize {
        self.intervals.len()
    }

    /// Total number of bytes covered.
    pub fn length(&self) -> u64 {
        self.intervals.iter().map(|&(s, e)| e - s).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}
