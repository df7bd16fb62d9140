use super::freelist::{Allocation, FreeList};
use crate::graph::{MemoryKind, TensorType};

/// Computes the number of bytes reserved for a tensor of a given type
///
/// This is the only part of an allocator which a target may customize; the
/// ledger itself is shared.
pub trait SizeRule {
    fn bytes(&self, ty: &TensorType) -> usize;
}

/// Tightly packed tensors
#[derive(Copy, Clone, Debug, Default)]
pub struct Dense;

impl SizeRule for Dense {
    fn bytes(&self, ty: &TensorType) -> usize {
        ty.bytes()
    }
}

/// Packed tensors, with every buffer rounded up to a multiple of `align`
///
/// Since every size is a multiple of `align`, so is every offset.
#[derive(Copy, Clone, Debug)]
pub struct Aligned(pub usize);

impl SizeRule for Aligned {
    fn bytes(&self, ty: &TensorType) -> usize {
        ty.bytes().next_multiple_of(self.0)
    }
}

/// Tensors whose innermost dimension is padded to a whole number of tiles
#[derive(Copy, Clone, Debug)]
pub struct Tiled {
    /// Tile width, in bytes
    pub tile: usize,
}

impl SizeRule for Tiled {
    fn bytes(&self, ty: &TensorType) -> usize {
        let Some((&inner, outer)) = ty.shape.split_last() else {
            return ty.dtype.size_of().next_multiple_of(self.tile);
        };
        let row = (inner * ty.dtype.size_of()).next_multiple_of(self.tile);
        outer.iter().product::<usize>() * row
    }
}

/// Allocator for a single memory kind
///
/// Wraps a [`FreeList`] with a size rule, and keeps track of the number of
/// bytes in use so that both the high-water mark and the largest live set
/// can be reported.
pub struct BufferAllocator {
    kind: MemoryKind,
    ledger: FreeList,
    rule: Box<dyn SizeRule>,
    live: usize,
    peak_live: usize,
}

impl BufferAllocator {
    pub fn new(
        kind: MemoryKind,
        capacity: Option<usize>,
        rule: Box<dyn SizeRule>,
    ) -> Self {
        let ledger = match capacity {
            Some(c) => FreeList::fixed(c),
            None => FreeList::unbounded(),
        };
        Self {
            kind,
            ledger,
            rule,
            live: 0,
            peak_live: 0,
        }
    }

    /// Builds an unbounded, densely packed allocator
    pub fn dense(kind: MemoryKind) -> Self {
        Self::new(kind, None, Box::new(Dense))
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn capacity(&self) -> Option<usize> {
        self.ledger.capacity()
    }

    /// Returns the number of bytes that a tensor of type `ty` would occupy
    pub fn size_of(&self, ty: &TensorType) -> usize {
        self.rule.bytes(ty)
    }

    /// Reserves space for a tensor, returning `None` if the memory is full
    pub fn allocate(&mut self, ty: &TensorType) -> Option<Allocation> {
        let a = self.ledger.allocate(self.size_of(ty))?;
        self.live += a.size;
        self.peak_live = self.peak_live.max(self.live);
        Some(a)
    }

    pub fn free(&mut self, a: Allocation) {
        self.live -= a.size;
        self.ledger.free(a);
    }

    /// Highest end address ever handed out
    pub fn max_usage(&self) -> usize {
        self.ledger.max_usage()
    }

    /// Largest number of bytes allocated at the same time
    ///
    /// This is a lower bound on [`max_usage`](Self::max_usage); the two
    /// differ when first-fit leaves holes that are too small to reuse.
    pub fn peak_live(&self) -> usize {
        self.peak_live
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::DataType;

    #[test]
    fn size_rules() {
        let t = TensorType::from_dims(DataType::U8, &[3, 5]);
        assert_eq!(Dense.bytes(&t), 15);
        assert_eq!(Aligned(8).bytes(&t), 16);
        assert_eq!(Tiled { tile: 64 }.bytes(&t), 3 * 64);

        let t = TensorType::from_dims(DataType::F32, &[2, 20]);
        assert_eq!(Tiled { tile: 64 }.bytes(&t), 2 * 128);

        let s = TensorType::scalar(DataType::F32);
        assert_eq!(Tiled { tile: 64 }.bytes(&s), 64);
        assert_eq!(Aligned(8).bytes(&s), 8);
    }

    #[test]
    fn peak_live_vs_high_water() {
        let mut a = BufferAllocator::dense(MemoryKind::Main);
        let t = |n| TensorType::from_dims(DataType::U8, &[n]);
        let x = a.allocate(&t(10)).unwrap();
        let y = a.allocate(&t(10)).unwrap();
        a.free(x);
        // Doesn't fit in the 10-byte hole, so the high-water mark grows
        let z = a.allocate(&t(11)).unwrap();
        assert_eq!(z.offset, 20);
        assert_eq!(a.max_usage(), 31);
        assert_eq!(a.peak_live(), 21);
        a.free(y);
        a.free(z);
        assert_eq!(a.peak_live(), 21);
    }

    #[test]
    fn fixed_capacity() {
        let mut a = BufferAllocator::new(
            MemoryKind::Accelerator,
            Some(128),
            Box::new(Tiled { tile: 64 }),
        );
        let t = TensorType::from_dims(DataType::U8, &[1, 3]);
        assert!(a.allocate(&t).is_some());
        assert!(a.allocate(&t).is_some());
        assert!(a.allocate(&t).is_none());
        assert_eq!(a.capacity(), Some(128));
    }
}
