//! Infrastructure for representing neural networks as dataflow graphs
//!
//! A [`Graph`] is an arena of nodes.  Each node owns an ordered list of input
//! ports and output ports; an input port refers to at most one producing
//! [`OutputPort`], and every output port keeps the set of [`InputPort`]s that
//! consume it.  Both directions are stored as plain handles, so the arena is
//! the single owner of everything.
//!
//! ```
//! use kiln::graph::{DataType, Graph, TensorType};
//!
//! let mut g = Graph::new();
//! let x = g.input("x", TensorType::from_dims(DataType::F32, &[1, 4]))?;
//! let y = g.transpose(x, &[1, 0])?;
//! g.output("y", y)?;
//! assert_eq!(g.len(), 3);
//! assert_eq!(g.output_type(y)?.shape.as_slice(), &[4, 1]);
//! # Ok::<(), kiln::Error>(())
//! ```
mod build;
mod indexed;
mod op;
mod text;
mod traverse;
mod types;

use indexed::{IndexVec, define_index};
pub use op::{
    BinaryOpcode, ClampRange, Conv2dParams, Op, Opcode, QuantParam,
    UnaryOpcode,
};
pub use types::{
    DataType, MAX_RANK, MemoryKind, NodeAttributes, Permutation,
    PortAttributes, Shape, TensorType, shape,
};

use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

define_index!(NodeId, "A handle to a node in a [`Graph`]");

/// An input connection point, identified by its node and position
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
pub struct InputPort {
    pub node: NodeId,
    pub index: usize,
}

/// An output connection point, identified by its node and position
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
pub struct OutputPort {
    pub node: NodeId,
    pub index: usize,
}

impl NodeId {
    /// Returns a handle to this node's `i`'th input port
    pub fn input(self, i: usize) -> InputPort {
        InputPort {
            node: self,
            index: i,
        }
    }

    /// Returns a handle to this node's `i`'th output port
    pub fn output(self, i: usize) -> OutputPort {
        OutputPort {
            node: self,
            index: i,
        }
    }
}

#[derive(Clone, Debug)]
struct OutputData {
    ty: TensorType,
    memory: MemoryKind,
    attrs: PortAttributes,
    consumers: BTreeSet<InputPort>,
}

/// A single operation instance, owned by its [`Graph`]
#[derive(Clone, Debug)]
pub struct Node {
    op: Op,
    name: String,
    inputs: Vec<Option<OutputPort>>,
    outputs: Vec<OutputData>,
    attrs: NodeAttributes,
}

impl Node {
    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producers feeding each input port, in order
    pub fn inputs(&self) -> &[Option<OutputPort>] {
        &self.inputs
    }

    /// Iterates over connected producers, skipping unconnected inputs
    pub fn producers(&self) -> impl Iterator<Item = OutputPort> + '_ {
        self.inputs.iter().flatten().copied()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn attributes(&self) -> NodeAttributes {
        self.attrs
    }
}

/// A `Graph` holds a set of nodes and the declared output nodes
///
/// It should be used like an arena allocator: handles are never reused, so a
/// [`NodeId`] to a removed node reliably produces [`Error::BadNode`].
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: IndexVec<Option<Node>, NodeId>,
    outputs: Vec<NodeId>,
    live: usize,
}

impl Graph {
    /// Build a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live nodes in the graph
    pub fn len(&self) -> usize {
        self.live
    }

    /// Checks whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns the declared output nodes, in declaration order
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Iterates over every live node, in creation order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter_map(|(i, n)| n.as_ref().map(|_| i))
    }

    /// Looks up a node by handle
    pub fn node(&self, id: NodeId) -> Result<&Node, Error> {
        self.nodes
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(Error::BadNode)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, Error> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(Error::BadNode)
    }

    /// Looks up an operation by `NodeId` handle
    pub fn get_op(&self, id: NodeId) -> Option<&Op> {
        self.node(id).ok().map(|n| &n.op)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    fn output_data(&self, port: OutputPort) -> Result<&OutputData, Error> {
        self.node(port.node)?
            .outputs
            .get(port.index)
            .ok_or(Error::BadPort(port.index))
    }

    fn output_data_mut(
        &mut self,
        port: OutputPort,
    ) -> Result<&mut OutputData, Error> {
        self.node_mut(port.node)?
            .outputs
            .get_mut(port.index)
            .ok_or(Error::BadPort(port.index))
    }

    fn check_input(&self, port: InputPort) -> Result<(), Error> {
        if port.index < self.node(port.node)?.inputs.len() {
            Ok(())
        } else {
            Err(Error::BadPort(port.index))
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Node creation

    /// Inserts a new node with unconnected inputs
    ///
    /// `outputs` must provide one type for each of the op's output ports; the
    /// memory kind of each port is picked from the op (constants and inputs
    /// get their own memory kinds, everything else lives in main memory).
    pub fn add_node(
        &mut self,
        op: Op,
        name: impl Into<String>,
        outputs: Vec<TensorType>,
    ) -> Result<NodeId, Error> {
        if outputs.len() != op.output_count() {
            return Err(Error::BadPort(outputs.len()));
        }
        let memory = match op {
            Op::Input => MemoryKind::Input,
            Op::Constant(..) => MemoryKind::Constant,
            Op::AccelUpload | Op::AccelConv2d(..) => MemoryKind::Accelerator,
            _ => MemoryKind::Main,
        };
        let node = Node {
            inputs: vec![None; op.input_count()],
            outputs: outputs
                .into_iter()
                .map(|ty| OutputData {
                    ty,
                    memory,
                    attrs: PortAttributes::empty(),
                    consumers: BTreeSet::new(),
                })
                .collect(),
            attrs: NodeAttributes::empty(),
            name: name.into(),
            op,
        };
        let is_output = matches!(node.op, Op::Output);
        let id = self.nodes.push(Some(node));
        if is_output {
            self.outputs.push(id);
        }
        self.live += 1;
        Ok(id)
    }

    pub fn set_name(
        &mut self,
        id: NodeId,
        name: impl Into<String>,
    ) -> Result<(), Error> {
        self.node_mut(id)?.name = name.into();
        Ok(())
    }

    pub fn attributes_mut(
        &mut self,
        id: NodeId,
    ) -> Result<&mut NodeAttributes, Error> {
        Ok(&mut self.node_mut(id)?.attrs)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Ports

    /// Returns the producer feeding the given input port, if any
    pub fn producer(&self, port: InputPort) -> Result<Option<OutputPort>, Error> {
        self.check_input(port)?;
        Ok(self.node(port.node)?.inputs[port.index])
    }

    /// Returns the producer feeding the given input port, or an error if it is
    /// unconnected
    pub fn connected_producer(
        &self,
        port: InputPort,
    ) -> Result<OutputPort, Error> {
        self.producer(port)?.ok_or_else(|| {
            let name = self
                .node(port.node)
                .map(|n| n.name.clone())
                .unwrap_or_default();
            Error::Unconnected(name, port.index)
        })
    }

    /// Returns the set of input ports consuming the given output port
    pub fn consumers(
        &self,
        port: OutputPort,
    ) -> Result<&BTreeSet<InputPort>, Error> {
        Ok(&self.output_data(port)?.consumers)
    }

    pub fn output_type(&self, port: OutputPort) -> Result<&TensorType, Error> {
        Ok(&self.output_data(port)?.ty)
    }

    pub fn memory_kind(&self, port: OutputPort) -> Result<MemoryKind, Error> {
        Ok(self.output_data(port)?.memory)
    }

    pub fn set_memory_kind(
        &mut self,
        port: OutputPort,
        kind: MemoryKind,
    ) -> Result<(), Error> {
        self.output_data_mut(port)?.memory = kind;
        Ok(())
    }

    pub fn port_attributes(
        &self,
        port: OutputPort,
    ) -> Result<PortAttributes, Error> {
        Ok(self.output_data(port)?.attrs)
    }

    pub fn port_attributes_mut(
        &mut self,
        port: OutputPort,
    ) -> Result<&mut PortAttributes, Error> {
        Ok(&mut self.output_data_mut(port)?.attrs)
    }

    /// Connects an input port to an output port
    ///
    /// Connecting a port to its existing producer is a no-op.  If the input
    /// port already has a different producer, returns
    /// [`Error::AlreadyConnected`]; the caller must
    /// [`disconnect`](Self::disconnect) it first.  Connections which would
    /// introduce a cycle are rejected with [`Error::WouldCycle`].
    pub fn connect(
        &mut self,
        input: InputPort,
        output: OutputPort,
    ) -> Result<(), Error> {
        self.check_input(input)?;
        self.output_data(output)?;
        match self.node(input.node)?.inputs[input.index] {
            Some(prev) if prev == output => return Ok(()),
            Some(..) => {
                return Err(Error::AlreadyConnected(
                    self.node(input.node)?.name.clone(),
                ));
            }
            None => (),
        }
        if self.depends_on(output.node, input.node) {
            return Err(Error::WouldCycle(
                self.node(input.node)?.name.clone(),
                self.node(output.node)?.name.clone(),
            ));
        }
        self.node_mut(input.node)?.inputs[input.index] = Some(output);
        self.output_data_mut(output)?.consumers.insert(input);
        Ok(())
    }

    /// Disconnects an input port, returning its previous producer
    pub fn disconnect(
        &mut self,
        input: InputPort,
    ) -> Result<Option<OutputPort>, Error> {
        self.check_input(input)?;
        let prev = self.node_mut(input.node)?.inputs[input.index].take();
        if let Some(p) = prev {
            let removed = self.output_data_mut(p)?.consumers.remove(&input);
            debug_assert!(removed, "back-reference out of sync");
        }
        Ok(prev)
    }

    /// Moves every consumer of `old` onto `new`
    pub fn replace_uses(
        &mut self,
        old: OutputPort,
        new: OutputPort,
    ) -> Result<(), Error> {
        if old == new {
            return Ok(());
        }
        let consumers = std::mem::take(&mut self.output_data_mut(old)?.consumers);
        for c in consumers {
            self.node_mut(c.node)?.inputs[c.index] = None;
            self.connect(c, new)?;
        }
        Ok(())
    }

    /// Checks whether `target` is `node` or one of its transitive producers
    pub fn depends_on(&self, node: NodeId, target: NodeId) -> bool {
        let mut todo = vec![node];
        let mut seen = HashSet::new();
        while let Some(n) = todo.pop() {
            if n == target {
                return true;
            }
            if !seen.insert(n) {
                continue;
            }
            if let Ok(node) = self.node(n) {
                todo.extend(node.producers().map(|p| p.node));
            }
        }
        false
    }

    ////////////////////////////////////////////////////////////////////////////
    // Dead code elimination

    /// Returns the set of nodes reachable from the declared outputs
    pub fn reachable(&self) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut todo: Vec<NodeId> = self.outputs.clone();
        while let Some(n) = todo.pop() {
            if !seen.insert(n) {
                continue;
            }
            if let Ok(node) = self.node(n) {
                todo.extend(node.producers().map(|p| p.node));
            }
        }
        seen
    }

    /// Removes every node which is not reachable from a declared output,
    /// returning the number of nodes removed.
    ///
    /// Back-references from surviving producers to removed consumers are
    /// dropped as well.
    pub fn dce(&mut self) -> usize {
        let keep = self.reachable();
        let mut removed = 0;
        for id in self.nodes.keys() {
            if self.nodes[id].is_some() && !keep.contains(&id) {
                self.nodes[id] = None;
                removed += 1;
            }
        }
        for id in self.nodes.keys() {
            if let Some(node) = &mut self.nodes[id] {
                for out in &mut node.outputs {
                    out.consumers.retain(|c| keep.contains(&c.node));
                }
            }
        }
        self.outputs.retain(|o| keep.contains(o));
        self.live -= removed;
        removed
    }
}

////////////////////////////////////////////////////////////////////////////////
