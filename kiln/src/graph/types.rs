//! Tensor types, memory kinds, and attribute bitsets
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Maximum tensor rank
pub const MAX_RANK: usize = 8;

/// Element type of a tensor
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
    I32,
    I8,
    U8,
}

impl DataType {
    /// Size of a single element, in bytes
    pub fn size_of(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Checks whether this is a quantized (8-bit integer) type
    pub fn is_quantized(self) -> bool {
        matches!(self, DataType::I8 | DataType::U8)
    }
}

/// Tensor dimensions, outermost first
pub type Shape = ArrayVec<usize, MAX_RANK>;

/// Axis permutation, as used by transposes
pub type Permutation = ArrayVec<usize, MAX_RANK>;

/// Builds a [`Shape`] from a slice, returning `None` if the rank is too large
pub fn shape(dims: &[usize]) -> Option<Shape> {
    dims.try_into().ok()
}

/// Semantic type carried by an output port
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: DataType,
    pub shape: Shape,
}

impl TensorType {
    pub fn new(dtype: DataType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Builds a type from a slice of dimensions
    ///
    /// # Panics
    /// If `dims` has more than [`MAX_RANK`] items
    pub fn from_dims(dtype: DataType, dims: &[usize]) -> Self {
        Self::new(dtype, shape(dims).expect("rank exceeds MAX_RANK"))
    }

    /// Returns a scalar of the given type
    pub fn scalar(dtype: DataType) -> Self {
        Self::new(dtype, Shape::new())
    }

    /// Number of elements in the tensor
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Dense size of the tensor, in bytes
    pub fn bytes(&self) -> usize {
        self.elements() * self.dtype.size_of()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Address space category, each with its own allocator
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
    enum_map::Enum,
)]
#[strum(serialize_all = "lowercase")]
pub enum MemoryKind {
    /// Graph inputs, provided by the runtime
    Input,
    /// Read-only data, materialized once into the constant blob
    Constant,
    /// General-purpose scratch memory
    Main,
    /// Accelerator-local scratchpad
    Accelerator,
}

impl MemoryKind {
    /// Buffers of this kind stay allocated for the whole program
    pub fn is_persistent(self) -> bool {
        matches!(self, MemoryKind::Input | MemoryKind::Constant)
    }
}

macro_rules! define_attributes {
    ($name:ident, $doc:literal, { $($(#[$m:meta])* $flag:ident = $bit:expr),* $(,)? }) => {
        #[doc = $doc]
        #[derive(
            Copy, Clone, Default, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
        )]
        pub struct $name(u8);

        impl $name {
            $(
                $(#[$m])*
                pub const $flag: Self = Self(1 << $bit);
            )*

            /// Returns an empty set
            pub const fn empty() -> Self {
                Self(0)
            }
            /// Checks whether every flag in `other` is set
            pub fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }
    };
}

define_attributes!(NodeAttributes, "Per-node attribute bitset", {
    /// Node participates in quantization
    QUANTIZE = 0,
    /// Node must not be merged into a neighbor by fusion rules
    SKIP_FUSION = 1,
});

define_attributes!(PortAttributes, "Per-output-port attribute bitset", {
    /// Buffer must never be released back to its allocator
    NO_REUSE = 0,
});

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tensor_bytes() {
        let t = TensorType::from_dims(DataType::F32, &[1, 3, 4, 4]);
        assert_eq!(t.elements(), 48);
        assert_eq!(t.bytes(), 192);
        assert_eq!(TensorType::scalar(DataType::U8).bytes(), 1);
        assert!(shape(&[1; 9]).is_none());
    }

    #[test]
    fn attributes() {
        let mut a = NodeAttributes::empty();
        assert!(!a.contains(NodeAttributes::QUANTIZE));
        a.insert(NodeAttributes::QUANTIZE);
        assert!(a.contains(NodeAttributes::QUANTIZE));
        assert!(!a.contains(NodeAttributes::QUANTIZE | NodeAttributes::SKIP_FUSION));
        a.remove(NodeAttributes::QUANTIZE);
        assert_eq!(a, NodeAttributes::empty());
    }

    #[test]
    fn parse_names() {
        assert_eq!("f32".parse::<DataType>().unwrap(), DataType::F32);
        assert_eq!("main".parse::<MemoryKind>().unwrap(), MemoryKind::Main);
        assert_eq!(MemoryKind::Accelerator.to_string(), "accelerator");
    }
}
