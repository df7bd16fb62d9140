use super::{match_chain, match_single, producer_of, single_use};
use crate::{
    Error,
    graph::{Graph, NodeId, Op, Opcode, OutputPort},
    transform::{Match, Transform, TransformContext},
};

/// Rewrites `transpose(transpose(x, p1), p2)` into `transpose(x, p1 ∘ p2)`
///
/// The inner transpose must have no other readers.
pub struct FoldTwoTransposes;

impl Transform for FoldTwoTransposes {
    fn name(&self) -> &'static str {
        "fold_two_transposes"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::Transpose]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        match producer_of(graph, node, 0) {
            Some((p, Op::Transpose(..))) if single_use(graph, p) => {
                match_chain(graph, p.node, node, ctx)
            }
            _ => false,
        }
    }

    fn process(
        &self,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<Vec<OutputPort>, Error> {
        let (Some(Op::Transpose(p1)), Some(Op::Transpose(p2))) =
            (graph.get_op(m.node(0)), graph.get_op(m.node(1)))
        else {
            return Err(Error::BadReplacement(self.name()));
        };
        // out[j] = mid[p2[j]] = x[p1[p2[j]]]
        let perm: Vec<usize> = p2.iter().map(|&j| p1[j]).collect();
        Ok(vec![graph.transpose(m.producer(0), &perm)?])
    }
}

/// Removes a transpose whose permutation is the identity
pub struct FoldNopTranspose;

impl Transform for FoldNopTranspose {
    fn name(&self) -> &'static str {
        "fold_nop_transpose"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::Transpose]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        match graph.get_op(node) {
            Some(Op::Transpose(perm))
                if perm.iter().enumerate().all(|(i, &p)| i == p) =>
            {
                match_single(graph, node, ctx)
            }
            _ => false,
        }
    }

    fn process(
        &self,
        _graph: &mut Graph,
        m: &Match,
    ) -> Result<Vec<OutputPort>, Error> {
        Ok(vec![m.producer(0)])
    }
}
