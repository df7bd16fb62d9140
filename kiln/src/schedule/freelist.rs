use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A byte range `[offset, offset + size)` within one memory kind
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub struct Allocation {
    pub offset: usize,
    pub size: usize,
}

impl Allocation {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Checks whether two ranges share at least one byte
    pub fn overlaps(&self, other: &Allocation) -> bool {
        self.size > 0
            && other.size > 0
            && self.offset < other.end()
            && other.offset < self.end()
    }
}

/// Ledger of unused address ranges, with first-fit allocation
///
/// Free ranges are stored as `start -> end`, ordered by start address, and
/// adjacent ranges are always merged.  A fixed ledger starts with a single
/// range `[0, capacity)`; an unbounded ledger starts with `[0, usize::MAX)`
/// and therefore never runs out.
#[derive(Clone, Debug)]
pub struct FreeList {
    free: BTreeMap<usize, usize>,
    capacity: Option<usize>,
    max_usage: usize,
}

impl FreeList {
    /// Builds a ledger for a memory of known size
    pub fn fixed(capacity: usize) -> Self {
        Self::new(Some(capacity))
    }

    /// Builds a ledger which grows on demand
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    fn new(capacity: Option<usize>) -> Self {
        let end = capacity.unwrap_or(usize::MAX);
        let mut free = BTreeMap::new();
        if end > 0 {
            free.insert(0, end);
        }
        Self {
            free,
            capacity,
            max_usage: 0,
        }
    }

    /// Returns the capacity, or `None` if the ledger is unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Highest end address ever handed out
    pub fn max_usage(&self) -> usize {
        self.max_usage
    }

    /// Iterates over free ranges as `(start, end)` pairs, in address order
    pub fn free_ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free.iter().map(|(s, e)| (*s, *e))
    }

    /// Finds the lowest free range that fits `size` bytes
    ///
    /// Returns `None` if no range is large enough.  Zero-sized requests
    /// always succeed at offset 0 without touching the ledger.
    pub fn allocate(&mut self, size: usize) -> Option<Allocation> {
        if size == 0 {
            return Some(Allocation { offset: 0, size });
        }
        let (&start, &end) =
            self.free.iter().find(|(s, e)| **e - **s >= size)?;
        self.free.remove(&start);
        if end - start > size {
            self.free.insert(start + size, end);
        }
        let a = Allocation {
            offset: start,
            size,
        };
        self.max_usage = self.max_usage.max(a.end());
        Some(a)
    }

    /// Returns a range to the ledger, merging it with its neighbors
    pub fn free(&mut self, a: Allocation) {
        if a.size == 0 {
            return;
        }
        let mut start = a.offset;
        let mut end = a.end();

        if let Some((&s, &e)) = self.free.range(..start).next_back() {
            debug_assert!(e <= start, "double free of {a:?}");
            if e == start {
                self.free.remove(&s);
                start = s;
            }
        }
        if let Some((&s, &e)) = self.free.range(start..).next() {
            debug_assert!(s >= end, "double free of {a:?}");
            if s == end {
                self.free.remove(&s);
                end = e;
            }
        }
        self.free.insert(start, end);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn first_fit_and_split() {
        let mut f = FreeList::fixed(256);
        let a = f.allocate(100).unwrap();
        let b = f.allocate(50).unwrap();
        assert_eq!(a, Allocation { offset: 0, size: 100 });
        assert_eq!(b, Allocation { offset: 100, size: 50 });
        assert_eq!(f.max_usage(), 150);

        f.free(a);
        // First fit picks the hole at the bottom
        let c = f.allocate(60).unwrap();
        assert_eq!(c.offset, 0);
        let d = f.allocate(40).unwrap();
        assert_eq!(d.offset, 60);
        assert_eq!(f.max_usage(), 150);

        // Too large for any remaining range
        assert!(f.allocate(107).is_none());
        assert!(f.allocate(106).is_some());
        assert_eq!(f.max_usage(), 256);
    }

    #[test]
    fn merge_on_free() {
        let mut f = FreeList::fixed(300);
        let a = f.allocate(100).unwrap();
        let b = f.allocate(100).unwrap();
        let c = f.allocate(100).unwrap();
        assert_eq!(f.free_ranges().count(), 0);

        f.free(a);
        f.free(c);
        assert_eq!(f.free_ranges().collect::<Vec<_>>(), [(0, 100), (200, 300)]);
        f.free(b);
        assert_eq!(f.free_ranges().collect::<Vec<_>>(), [(0, 300)]);
        assert_eq!(f.allocate(300).unwrap().offset, 0);
    }

    #[test]
    fn unbounded_never_fails() {
        let mut f = FreeList::unbounded();
        assert_eq!(f.capacity(), None);
        let a = f.allocate(1 << 40).unwrap();
        let b = f.allocate(1 << 40).unwrap();
        assert_eq!(b.offset, a.end());
        assert_eq!(f.max_usage(), 1 << 41);
    }

    #[test]
    fn zero_sized() {
        let mut f = FreeList::fixed(0);
        let a = f.allocate(0).unwrap();
        assert!(f.allocate(1).is_none());
        f.free(a);
        assert_eq!(f.max_usage(), 0);
    }

    #[test]
    fn random_alloc_free_cycles() {
        let mut rng = StdRng::seed_from_u64(0x66726565);
        let mut f = FreeList::fixed(4096);
        let mut live: Vec<Allocation> = vec![];
        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..256);
                if let Some(a) = f.allocate(size) {
                    assert!(live.iter().all(|b| !a.overlaps(b)));
                    live.push(a);
                }
            } else {
                let i = rng.gen_range(0..live.len());
                f.free(live.swap_remove(i));
            }
            // Free ranges are sorted, disjoint and never adjacent
            let ranges: Vec<_> = f.free_ranges().collect();
            for w in ranges.windows(2) {
                assert!(w[0].1 < w[1].0);
            }
        }
        for a in live.drain(..) {
            f.free(a);
        }
        assert_eq!(f.free_ranges().collect::<Vec<_>>(), [(0, 4096)]);
    }
}
