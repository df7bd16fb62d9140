use super::{match_chain, match_single, producer_of, single_use};
use crate::{
    Error,
    graph::{Graph, NodeId, Op, Opcode, OutputPort},
    transform::{Match, Transform, TransformContext},
};

/// Rewrites `reshape(reshape(x, a), b)` into `reshape(x, b)`
pub struct FoldTwoReshapes;

impl Transform for FoldTwoReshapes {
    fn name(&self) -> &'static str {
        "fold_two_reshapes"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::Reshape]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        match producer_of(graph, node, 0) {
            Some((p, Op::Reshape(..))) if single_use(graph, p) => {
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
        let Some(Op::Reshape(s)) = graph.get_op(m.node(1)) else {
            return Err(Error::BadReplacement(self.name()));
        };
        let s = s.clone();
        Ok(vec![graph.reshape(m.producer(0), &s)?])
    }
}

/// Removes a reshape which doesn't change its input's shape
pub struct FoldNopReshape;

impl Transform for FoldNopReshape {
    fn name(&self) -> &'static str {
        "fold_nop_reshape"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::Reshape]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        if !matches!(graph.get_op(node), Some(Op::Reshape(..))) {
            return false;
        }
        let Some((p, _)) = producer_of(graph, node, 0) else {
            return false;
        };
        let (Ok(before), Ok(after)) =
            (graph.output_type(p), graph.output_type(node.output(0)))
        else {
            return false;
        };
        before == after && match_single(graph, node, ctx)
    }

    fn process(
        &self,
        _graph: &mut Graph,
        m: &Match,
    ) -> Result<Vec<OutputPort>, Error> {
        Ok(vec![m.producer(0)])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{DataType, TensorType};
    use crate::transform::{Pass, rules::test_util::feeding};

    #[test]
    fn reshape_chain_collapses() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[2, 6]))
            .unwrap();
        let a = g.reshape(x, &[3, 4]).unwrap();
        let b = g.reshape(a, &[12]).unwrap();
        let c = g.reshape(b, &[2, 6]).unwrap();
        g.output("y", c).unwrap();

        let pass = Pass::new("fold")
            .with(FoldTwoReshapes)
            .with(FoldNopReshape);
        let stats = pass.run(&mut g, 100).unwrap();
        assert_eq!(stats.by_rule["fold_two_reshapes"], 2);
        assert_eq!(stats.by_rule["fold_nop_reshape"], 1);
        assert_eq!(g.len(), 2);
        assert_eq!(feeding(&g, 0).1, Op::Input);
    }

    #[test]
    fn real_reshape_is_kept() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[2, 6]))
            .unwrap();
        let a = g.reshape(x, &[3, 4]).unwrap();
        g.output("y", a).unwrap();
        let stats = Pass::new("nop")
            .with(FoldNopReshape)
            .run(&mut g, 100)
            .unwrap();
        assert_eq!(stats.rewrites, 0);
        assert_eq!(g.len(), 3);
    }
}
