//! Module containing the kiln universal error type
use crate::graph::{MemoryKind, Opcode};
use thiserror::Error;

/// Universal error type for kiln
#[derive(Error, Debug)]
pub enum Error {
    /// Node is not present in this `Graph`
    #[error("node is not present in this `Graph`")]
    BadNode,

    /// Port index is out of range for its node
    #[error("port index {0} is out of range for its node")]
    BadPort(usize),

    /// `Graph` has no declared outputs
    #[error("`Graph` has no declared outputs")]
    EmptyGraph,

    /// Input port already has a different producer
    #[error("input port of `{0}` is already connected; disconnect it first")]
    AlreadyConnected(String),

    /// Input port has no producer
    #[error("input port {1} of `{0}` is not connected")]
    Unconnected(String, usize),

    /// Connection would introduce a cycle
    #[error("connecting `{0}` to `{1}` would introduce a cycle")]
    WouldCycle(String, String),

    /// Operand shapes are incompatible
    #[error("shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),

    /// Element type does not match what the operation expects
    #[error("type mismatch in `{0}`")]
    TypeMismatch(String),

    /// Invalid transpose permutation
    #[error("invalid permutation {0:?}")]
    BadPermutation(Vec<usize>),

    /// Tensor rank is unsupported for this operation
    #[error("rank {0} is unsupported here")]
    BadRank(usize),

    /// Reshape changes the number of elements
    #[error("cannot reshape {0} elements into {1} elements")]
    BadReshape(usize, usize),

    /// A fixed-size memory kind cannot satisfy an allocation
    #[error(
        "out of {kind} memory while allocating {requested} bytes for `{node}` \
         (capacity {capacity})"
    )]
    OutOfMemory {
        /// Memory kind that was exhausted
        kind: MemoryKind,
        /// Name of the node whose output was being allocated
        node: String,
        /// Requested size, in bytes
        requested: usize,
        /// Capacity of the memory kind, in bytes
        capacity: usize,
    },

    /// No allocator is available for a memory kind which is in use
    #[error("no allocator for {0} memory, needed by `{1}`")]
    NoAllocator(MemoryKind, String),

    /// Two simultaneously-live buffers share an address range
    #[error("live buffers `{0}` and `{1}` overlap in {2} memory")]
    OverlappingAllocations(String, String, MemoryKind),

    /// A rewrite returned a replacement that doesn't fit its boundary
    #[error("rule `{0}` produced an invalid replacement")]
    BadReplacement(&'static str),

    /// A pass kept rewriting without converging
    #[error("pass `{0}` did not converge after {1} rewrites")]
    PassDiverged(String, usize),

    /// No rule could legalize this operation for the chosen target
    #[error("`{node}` ({op}) is not supported by target `{target}`")]
    Unsupported {
        /// Name of the offending node
        node: String,
        /// Its opcode
        op: Opcode,
        /// Name of the target
        target: &'static str,
    },

    /// Unknown opcode {0}
    #[error("unknown opcode {0}")]
    UnknownOpcode(String),

    /// Unknown value {0}
    #[error("unknown value {0}")]
    UnknownValue(String),

    /// Malformed line in a text graph
    #[error("parse error on line {0}: {1}")]
    ParseError(usize, String),

    /// Empty file
    #[error("empty file")]
    EmptyFile,

    /// IO error; see inner code for details
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
