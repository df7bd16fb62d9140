//! Execution order and buffer placement
//!
//! The scheduler walks the final graph once, in dependency order.  When a
//! node runs, each of its outputs is given a buffer in the allocator for
//! that output's memory kind; once the node has run, each of its inputs
//! drops a reference, and a buffer whose last reader has run is returned to
//! its allocator.  Buffers in persistent memory kinds, buffers which feed a
//! declared output, and ports marked [`NO_REUSE`](PortAttributes::NO_REUSE)
//! are pinned: they stay allocated until the end of the program.
//!
//! ```
//! use kiln::graph::{DataType, Graph, MemoryKind, TensorType, UnaryOpcode};
//! use kiln::schedule::{Allocators, BufferAllocator, schedule};
//!
//! let mut g = Graph::new();
//! let x = g.input("x", TensorType::from_dims(DataType::F32, &[8]))?;
//! let a = g.unary(UnaryOpcode::Abs, x)?;
//! let b = g.unary(UnaryOpcode::Neg, a)?;
//! let c = g.unary(UnaryOpcode::Exp, b)?;
//! g.output("c", c)?;
//!
//! let s = schedule(&g, Allocators::dense())?;
//! assert_eq!(s.compute_sequence.len(), 5);
//! // `c` reuses the space that `a` gave up
//! assert_eq!(s.allocation(c), s.allocation(a));
//! assert_eq!(s.max_usage[MemoryKind::Main], 64);
//! # Ok::<(), kiln::Error>(())
//! ```
mod alloc;
mod freelist;
mod optimize;
mod verify;

pub use alloc::{Aligned, BufferAllocator, Dense, SizeRule, Tiled};
pub use freelist::{Allocation, FreeList};
pub use optimize::optimize;
pub use verify::verify;

use crate::{
    Error,
    graph::{Graph, MemoryKind, NodeId, Op, OutputPort, PortAttributes},
};
use enum_map::EnumMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use strum::IntoEnumIterator;

/// One allocator slot per memory kind
///
/// Kinds without an allocator may not appear in a scheduled graph.
pub struct Allocators(pub EnumMap<MemoryKind, Option<BufferAllocator>>);

impl Allocators {
    /// Builds a set of unbounded, densely packed allocators for every kind
    pub fn dense() -> Self {
        Self(EnumMap::from_fn(|k| Some(BufferAllocator::dense(k))))
    }

    /// Returns the capacity of every fixed-size kind
    pub fn capacities(&self) -> EnumMap<MemoryKind, Option<usize>> {
        EnumMap::from_fn(|k| self.0[k].as_ref().and_then(|a| a.capacity()))
    }
}

/// A buffer assigned to a single output port
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    pub port: OutputPort,
    pub kind: MemoryKind,
    pub alloc: Allocation,
    /// Step in the compute sequence which produces this buffer
    pub first: usize,
    /// Last step at which this buffer is live (inclusive)
    pub last: usize,
    /// Pinned buffers are never returned to their allocator
    pub pinned: bool,
}

impl Buffer {
    /// Checks whether two buffers are live at the same time
    pub fn lifetime_overlaps(&self, other: &Buffer) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    /// Checks whether two buffers conflict: same memory kind, overlapping
    /// lifetimes, and overlapping address ranges
    pub fn conflicts(&self, other: &Buffer) -> bool {
        self.kind == other.kind
            && self.lifetime_overlaps(other)
            && self.alloc.overlaps(&other.alloc)
    }
}

/// Hand-off to code generation: execution order and buffer placement
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schedule {
    /// Nodes in execution order
    pub compute_sequence: Vec<NodeId>,
    /// Buffer for every output port of every scheduled node
    pub buffers: BTreeMap<OutputPort, Buffer>,
    /// High-water mark of each memory kind
    pub max_usage: EnumMap<MemoryKind, usize>,
    /// Largest number of simultaneously live bytes in each memory kind
    pub peak_live: EnumMap<MemoryKind, usize>,
}

impl Schedule {
    pub fn allocation(&self, port: OutputPort) -> Option<Allocation> {
        self.buffers.get(&port).map(|b| b.alloc)
    }

    /// Iterates over buffers of a single memory kind
    pub fn buffers_of(
        &self,
        kind: MemoryKind,
    ) -> impl Iterator<Item = &Buffer> + '_ {
        self.buffers.values().filter(move |b| b.kind == kind)
    }

    /// Recomputes the high-water mark of each kind from buffer placement
    pub(crate) fn recompute_max_usage(&mut self) {
        let mut out = EnumMap::default();
        for b in self.buffers.values() {
            out[b.kind] = b.alloc.end().max(out[b.kind]);
        }
        self.max_usage = out;
    }
}

/// Schedules a graph, assigning every output port a buffer
pub fn schedule(graph: &Graph, allocators: Allocators) -> Result<Schedule, Error> {
    Scheduler::new(graph, allocators).run()
}

struct Scheduler<'a> {
    graph: &'a Graph,
    allocators: EnumMap<MemoryKind, Option<BufferAllocator>>,
    /// Nodes which appear in the compute sequence
    scheduled: HashSet<NodeId>,
    /// Remaining readers of each allocated port
    refcount: HashMap<OutputPort, usize>,
    buffers: BTreeMap<OutputPort, Buffer>,
}

impl<'a> Scheduler<'a> {
    fn new(graph: &'a Graph, allocators: Allocators) -> Self {
        Self {
            graph,
            allocators: allocators.0,
            scheduled: HashSet::new(),
            refcount: HashMap::new(),
            buffers: BTreeMap::new(),
        }
    }

    fn run(mut self) -> Result<Schedule, Error> {
        if self.graph.outputs().is_empty() {
            return Err(Error::EmptyGraph);
        }
        let order = self.graph.postorder();
        let end = order.len() - 1;
        self.scheduled = order.iter().copied().collect();

        for (step, &n) in order.iter().enumerate() {
            let node = self.graph.node(n)?;

            for i in 0..node.output_count() {
                self.allocate(n.output(i), step, end)?;
            }
            for p in node.producers() {
                self.release(p, step)?;
            }
            // Outputs which nobody reads are dead as soon as they're made
            for i in 0..node.output_count() {
                let port = n.output(i);
                if self.refcount.get(&port) == Some(&0) {
                    self.free(port)?;
                }
            }
        }

        let mut max_usage = EnumMap::default();
        let mut peak_live = EnumMap::default();
        for (k, a) in &self.allocators {
            if let Some(a) = a {
                max_usage[k] = a.max_usage();
                peak_live[k] = a.peak_live();
            }
        }
        for k in MemoryKind::iter() {
            if max_usage[k] > 0 {
                info!(
                    "{k} memory: {} bytes reserved, {} bytes peak live",
                    max_usage[k], peak_live[k]
                );
            }
        }
        Ok(Schedule {
            compute_sequence: order,
            buffers: self.buffers,
            max_usage,
            peak_live,
        })
    }

    fn allocate(
        &mut self,
        port: OutputPort,
        step: usize,
        end: usize,
    ) -> Result<(), Error> {
        if self.buffers.contains_key(&port) {
            return Ok(());
        }
        let g = self.graph;
        let ty = g.output_type(port)?;
        let kind = g.memory_kind(port)?;
        let name = g.node(port.node)?.name();
        let Some(alloc) = self.allocators[kind].as_mut() else {
            return Err(Error::NoAllocator(kind, name.to_owned()));
        };
        let Some(a) = alloc.allocate(ty) else {
            return Err(Error::OutOfMemory {
                kind,
                node: name.to_owned(),
                requested: alloc.size_of(ty),
                capacity: alloc.capacity().unwrap_or(usize::MAX),
            });
        };

        // Readers which were never scheduled don't hold a reference
        let readers: Vec<_> = g
            .consumers(port)?
            .iter()
            .filter(|c| self.scheduled.contains(&c.node))
            .collect();
        let pinned = kind.is_persistent()
            || g.port_attributes(port)?.contains(PortAttributes::NO_REUSE)
            || readers
                .iter()
                .any(|c| matches!(g.get_op(c.node), Some(Op::Output)));
        debug!("`{name}` -> {kind} {a:?}{}", if pinned { " (pinned)" } else { "" });

        self.refcount.insert(port, readers.len());
        self.buffers.insert(
            port,
            Buffer {
                port,
                kind,
                alloc: a,
                first: step,
                last: if pinned { end } else { step },
                pinned,
            },
        );
        Ok(())
    }

    /// Drops one reference to `port`, freeing it if that was the last one
    fn release(&mut self, port: OutputPort, step: usize) -> Result<(), Error> {
        let Some(rc) = self.refcount.get_mut(&port) else {
            return Err(Error::BadNode);
        };
        *rc -= 1;
        let done = *rc == 0;
        if let Some(b) = self.buffers.get_mut(&port) {
            if !b.pinned {
                b.last = step;
            }
        }
        if done {
            self.free(port)?;
        }
        Ok(())
    }

    fn free(&mut self, port: OutputPort) -> Result<(), Error> {
        let Some(b) = self.buffers.get(&port) else {
            return Err(Error::BadNode);
        };
        if !b.pinned {
            if let Some(a) = self.allocators[b.kind].as_mut() {
                a.free(b.alloc);
            }
        }
        Ok(())
    }
}
