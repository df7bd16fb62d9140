//! Target-independent rewrite rules
mod fusion;
mod quantize;
mod reshape;
mod transpose;

pub use fusion::{FuseClamp, LowerRelu};
pub use quantize::FoldQuantizeDequantize;
pub use reshape::{FoldNopReshape, FoldTwoReshapes};
pub use transpose::{FoldNopTranspose, FoldTwoTransposes};

use super::TransformContext;
use crate::graph::{Graph, NodeId, Op, OutputPort};

/// Returns the producer of a node's `i`'th input, if connected
pub(crate) fn producer_of(
    graph: &Graph,
    node: NodeId,
    i: usize,
) -> Option<(OutputPort, &Op)> {
    let p = graph.producer(node.input(i)).ok()??;
    let op = graph.get_op(p.node)?;
    Some((p, op))
}

/// Checks whether an output port is read by exactly one input port
pub(crate) fn single_use(graph: &Graph, port: OutputPort) -> bool {
    graph.consumers(port).is_ok_and(|c| c.len() == 1)
}

/// Fills in a context for a single-output node with every input external
pub(crate) fn match_single(
    graph: &Graph,
    node: NodeId,
    ctx: &mut TransformContext,
) -> bool {
    let Ok(n) = graph.node(node) else {
        return false;
    };
    ctx.nodes = vec![node];
    ctx.inputs = (0..n.inputs().len()).map(|i| node.input(i)).collect();
    ctx.outputs = vec![node.output(0)];
    true
}

/// Fills in a context for a `first -> second` chain, where `first` feeds
/// only `second`
///
/// Every input of `first` is external, as is every input of `second` other
/// than the one fed by `first`.
pub(crate) fn match_chain(
    graph: &Graph,
    first: NodeId,
    second: NodeId,
    ctx: &mut TransformContext,
) -> bool {
    let (Ok(a), Ok(b)) = (graph.node(first), graph.node(second)) else {
        return false;
    };
    ctx.nodes = vec![first, second];
    ctx.inputs = (0..a.inputs().len()).map(|i| first.input(i)).collect();
    ctx.inputs.extend(
        b.inputs()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some_and(|p| p.node != first))
            .map(|(i, _)| second.input(i)),
    );
    ctx.outputs = vec![second.output(0)];
    true
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::graph::{Graph, Op, OutputPort};

    /// Follows an output node back to the op that feeds it
    pub fn feeding(g: &Graph, output: usize) -> (OutputPort, Op) {
        let out = g.outputs()[output];
        let p = g.connected_producer(out.input(0)).unwrap();
        (p, g.get_op(p.node).unwrap().clone())
    }
}
