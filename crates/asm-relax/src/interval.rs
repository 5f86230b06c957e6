//! Static interval index over bytecode index ranges.
//!
//! The optimizer inserts one closed interval per span term, freezes the
//! index, and then asks "which terms cover bytecode `i`?" every time a
//! bytecode grows.  Entries are sorted by their low end and laid out as an
//! implicit balanced tree (the midpoint of each range is the subtree root),
//! each node carrying the maximum high end of its subtree.

use alloc::vec::Vec;

#[derive(Debug, Clone)]
struct Entry<T> {
    low: usize,
    high: usize,
    data: T,
}

/// Closed intervals `[low, high]` with attached data.
#[derive(Debug, Clone)]
pub struct IntervalIndex<T> {
    entries: Vec<Entry<T>>,
    max_high: Vec<usize>,
    built: bool,
}

impl<T> Default for IntervalIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntervalIndex<T> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            max_high: Vec::new(),
            built: true,
        }
    }

    /// Add `[low, high]`.  Queries fall back to a linear scan until
    /// [`build`](Self::build) is called again.
    pub fn insert(&mut self, low: usize, high: usize, data: T) {
        debug_assert!(low <= high, "interval [{}, {}] is empty", low, high);
        self.entries.push(Entry { low, high, data });
        self.built = false;
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no intervals.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the index for logarithmic queries.
    pub fn build(&mut self) {
        // Stable: equal lows keep insertion order, so query results are
        // deterministic.
        self.entries.sort_by_key(|e| e.low);
        self.max_high.clear();
        self.max_high.resize(self.entries.len(), 0);
        if !self.entries.is_empty() {
            self.build_max(0, self.entries.len());
        }
        self.built = true;
    }

    fn build_max(&mut self, lo: usize, hi: usize) -> usize {
        let mid = lo + (hi - lo) / 2;
        let mut m = self.entries[mid].high;
        if lo < mid {
            m = m.max(self.build_max(lo, mid));
        }
        if mid + 1 < hi {
            m = m.max(self.build_max(mid + 1, hi));
        }
        self.max_high[mid] = m;
        m
    }

    /// Call `f` for every interval overlapping `[low, high]`, in order of
    /// increasing low end.
    pub fn enumerate(&self, low: usize, high: usize, mut f: impl FnMut(&T)) {
        if self.built {
            self.query(0, self.entries.len(), low, high, &mut f);
        } else {
            for e in &self.entries {
                if e.low <= high && e.high >= low {
                    f(&e.data);
                }
            }
        }
    }

    fn query(&self, lo: usize, hi: usize, low: usize, high: usize, f: &mut impl FnMut(&T)) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        if self.max_high[mid] < low {
            return;
        }
        self.query(lo, mid, low, high, f);
        let e = &self.entries[mid];
        // Everything to the right starts at or after e.low.
        if e.low > high {
            return;
        }
        if e.high >= low {
            f(&e.data);
        }
        self.query(mid + 1, hi, low, high, f);
    }
}
