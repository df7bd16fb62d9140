use super::{match_chain, producer_of, single_use};
use crate::{
    Error,
    graph::{Graph, NodeId, Op, Opcode, OutputPort},
    transform::{Match, Transform, TransformContext},
};

/// Rewrites `quantize(dequantize(q, p), p)` into `q`
///
/// This only applies when both sides use identical parameters and the
/// original value already has the requested element type, so the round trip
/// is exact.
pub struct FoldQuantizeDequantize;

impl Transform for FoldQuantizeDequantize {
    fn name(&self) -> &'static str {
        "fold_quantize_dequantize"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::Quantize]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        let Some(Op::Quantize(qp, dtype)) = graph.get_op(node) else {
            return false;
        };
        let Some((d, Op::Dequantize(dp))) = producer_of(graph, node, 0) else {
            return false;
        };
        let Some((src, _)) = producer_of(graph, d.node, 0) else {
            return false;
        };
        qp == dp
            && graph.output_type(src).is_ok_and(|t| t.dtype == *dtype)
            && single_use(graph, d)
            && match_chain(graph, d.node, node, ctx)
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
    use crate::graph::{DataType, QuantParam, TensorType};
    use crate::transform::{Pass, rules::test_util::feeding};

    #[test]
    fn exact_round_trip_folds() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[16]))
            .unwrap();
        let p = QuantParam::new(0.1, 3);
        let q = g.quantize(x, p, DataType::U8).unwrap();
        let d = g.dequantize(q, p).unwrap();
        let q2 = g.quantize(d, p, DataType::U8).unwrap();
        let y = g.dequantize(q2, p).unwrap();
        g.output("y", y).unwrap();

        let stats = Pass::new("fold")
            .with(FoldQuantizeDequantize)
            .run(&mut g, 100)
            .unwrap();
        assert_eq!(stats.rewrites, 1);
        assert_eq!(g.len(), 4);
        let (p_out, _) = feeding(&g, 0);
        assert_eq!(g.connected_producer(p_out.node.input(0)).unwrap(), q);
    }

    #[test]
    fn mismatched_params_are_kept() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[16]))
            .unwrap();
        let q = g.quantize(x, QuantParam::new(0.1, 3), DataType::U8).unwrap();
        let d = g.dequantize(q, QuantParam::new(0.1, 3)).unwrap();
        let q2 = g.quantize(d, QuantParam::new(0.2, 3), DataType::U8).unwrap();
        let q3 = g.dequantize(q2, QuantParam::new(0.2, 3)).unwrap();
        let i8 = g.quantize(q3, QuantParam::new(0.2, 3), DataType::I8).unwrap();
        g.output("y", i8).unwrap();

        let stats = Pass::new("fold")
            .with(FoldQuantizeDequantize)
            .run(&mut g, 100)
            .unwrap();
        assert_eq!(stats.rewrites, 0);
    }
}
