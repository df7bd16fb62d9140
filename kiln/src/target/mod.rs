//! Compilation targets
//!
//! A target decides which rewrite passes run (and in what order), which
//! operations may remain once they have converged, and which memory kinds
//! exist along with their allocators.
mod accel;
mod cpu;

pub use accel::{AccelTarget, FoldUploadDownload, LowerConv2dToAccel};
pub use cpu::CpuTarget;

use crate::{
    Error,
    graph::{Graph, NodeId},
    schedule::Allocators,
    transform::{Pass, rules},
};

/// A compilation target
pub trait Target {
    /// Name of the target, used in diagnostics
    fn name(&self) -> &'static str;

    /// Passes to run, in order
    ///
    /// Passes don't commute, so this order is part of the target's
    /// definition.
    fn passes(&self) -> Vec<Pass>;

    /// Builds a fresh allocator for each memory kind that the target has
    fn allocators(&self) -> Allocators;

    /// Checks whether a node can be executed as-is by this target
    fn is_supported(&self, graph: &Graph, node: NodeId) -> bool;
}

/// Checks that every reachable node is supported by `target`
///
/// Returns [`Error::Unsupported`] for the first offending node in
/// dependency order.
pub fn check_supported(graph: &Graph, target: &dyn Target) -> Result<(), Error> {
    for n in graph.postorder() {
        if !target.is_supported(graph, n) {
            let node = graph.node(n)?;
            return Err(Error::Unsupported {
                node: node.name().to_owned(),
                op: node.op().opcode(),
                target: target.name(),
            });
        }
    }
    Ok(())
}

/// Rewrites operations into the forms that other passes expect
pub(crate) fn legalize() -> Pass {
    Pass::new("legalize").with(rules::LowerRelu)
}

/// Removes redundant data movement
pub(crate) fn fold() -> Pass {
    Pass::new("fold")
        .with(rules::FoldTwoTransposes)
        .with(rules::FoldNopTranspose)
        .with(rules::FoldTwoReshapes)
        .with(rules::FoldNopReshape)
        .with(rules::FoldQuantizeDequantize)
}

/// Merges activations into the operations that produce them
pub(crate) fn fuse() -> Pass {
    Pass::new("fuse").with(rules::FuseClamp)
}
