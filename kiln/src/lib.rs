//! Kiln is the middle end of an ahead-of-time compiler for neural networks.
//!
//! It takes a dataflow graph of tensor operations, rewrites it until it only
//! contains operations that the chosen target can run, and then decides the
//! order in which nodes execute and where every intermediate tensor lives in
//! memory.  The two artifacts it produces (an execution order and a buffer
//! map) are what a code generator needs to emit a binary package.
//!
//! # Graph construction
//! Networks are built in a [`Graph`](crate::graph::Graph), which serves as an
//! arena for nodes.  Nodes are created and connected through typed builder
//! functions, which also infer output shapes:
//! ```
//! use kiln::graph::{DataType, Graph, TensorType, UnaryOpcode};
//!
//! let mut g = Graph::new();
//! let x = g.input("x", TensorType::from_dims(DataType::F32, &[1, 16]))?;
//! let y = g.unary(UnaryOpcode::Relu, x)?;
//! g.output("y", y)?;
//! # Ok::<(), kiln::Error>(())
//! ```
//!
//! Graphs can also be loaded from a loose text format with
//! [`Graph::from_text`](crate::graph::Graph::from_text), and exported to
//! GraphViz with [`Graph::dot`](crate::graph::Graph::dot).
//!
//! # Rewriting
//! Rewrites are organized into [`Pass`](crate::transform::Pass)es, each
//! holding a set of [`Transform`](crate::transform::Transform) rules keyed by
//! opcode.  The engine only lets a rule rewrite a region after checking that
//! none of the region's internal values escape it.
//!
//! # Targets and scheduling
//! A [`Target`](crate::target::Target) supplies the ordered pass list, the
//! memory kinds it supports, and one allocator per kind.  After the passes
//! converge, [`schedule`](crate::schedule::schedule) walks the graph once,
//! assigning buffers as values are produced and releasing them after their
//! last reader.
//!
//! [`compile`] ties all of this together:
//! ```
//! use kiln::{CompileOptions, compile, graph::Graph, target::AccelTarget};
//! use kiln::graph::MemoryKind;
//!
//! let txt = "
//! x input f32 1,8,16,16
//! w const f32 8,8,3,3 0.1
//! b const f32 8
//! c conv2d x w b 1,1 1,1 +quantize
//! r relu c
//! y output r
//! ";
//! let g = Graph::from_text(txt.as_bytes())?;
//! let c = compile(g, &AccelTarget::default(), &CompileOptions::default())?;
//! assert!(c.schedule.max_usage[MemoryKind::Accelerator] > 0);
//! # Ok::<(), kiln::Error>(())
//! ```
pub mod compile;
pub mod graph;
pub mod schedule;
pub mod target;
pub mod transform;

mod error;
pub use compile::{CompileOptions, Compiled, compile};
pub use error::Error;
