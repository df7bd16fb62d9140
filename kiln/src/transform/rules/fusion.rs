use super::{match_chain, match_single, producer_of, single_use};
use crate::{
    Error,
    graph::{
        Graph, NodeAttributes, NodeId, Op, Opcode, OutputPort, UnaryOpcode,
    },
    transform::{Match, Transform, TransformContext},
};

/// Rewrites `relu(x)` into `clamp(x, 0, inf)`, so that it can be fused
pub struct LowerRelu;

impl Transform for LowerRelu {
    fn name(&self) -> &'static str {
        "lower_relu"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::Unary]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        matches!(graph.get_op(node), Some(Op::Unary(UnaryOpcode::Relu)))
            && match_single(graph, node, ctx)
    }

    fn process(
        &self,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<Vec<OutputPort>, Error> {
        Ok(vec![graph.clamp(m.producer(0), 0.0, f32::INFINITY)?])
    }
}

/// Folds a clamp into the convolution or matrix multiply which feeds it
///
/// Nodes marked with [`NodeAttributes::SKIP_FUSION`] are left alone.
pub struct FuseClamp;

impl Transform for FuseClamp {
    fn name(&self) -> &'static str {
        "fuse_clamp"
    }

    fn opcodes(&self) -> &'static [Opcode] {
        &[Opcode::Clamp]
    }

    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool {
        let skip = |n: NodeId| {
            graph.node(n).map_or(true, |n| {
                n.attributes().contains(NodeAttributes::SKIP_FUSION)
            })
        };
        match producer_of(graph, node, 0) {
            Some((p, Op::Conv2d(..) | Op::MatMul(..)))
                if single_use(graph, p) && !skip(p.node) && !skip(node) =>
            {
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
        let Some(Op::Clamp(range)) = graph.get_op(m.node(1)) else {
            return Err(Error::BadReplacement(self.name()));
        };
        let range = *range;
        let producer = graph.node(m.node(0))?;
        let attrs = producer.attributes();
        let out = match producer.op().clone() {
            Op::Conv2d(mut params) => {
                params.clamp = params.clamp.intersect(&range);
                graph.conv2d(m.producer(0), m.producer(1), m.producer(2), params)?
            }
            Op::MatMul(prev) => graph.matmul_clamped(
                m.producer(0),
                m.producer(1),
                prev.intersect(&range),
            )?,
            _ => return Err(Error::BadReplacement(self.name())),
        };
        *graph.attributes_mut(out.node)? = attrs;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{
        ClampRange, Conv2dParams, DataType, NodeAttributes, TensorType,
    };
    use crate::transform::{Pass, rules::test_util::feeding};

    fn conv_relu6(skip: bool) -> Graph {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[1, 3, 4, 4]))
            .unwrap();
        let w = g.constant_f32(&[8, 3, 1, 1], &[0.5; 24]).unwrap();
        let b = g.constant_f32(&[8], &[0.0; 8]).unwrap();
        let c = g.conv2d(x, w, b, Conv2dParams::default()).unwrap();
        if skip {
            g.attributes_mut(c.node)
                .unwrap()
                .insert(NodeAttributes::SKIP_FUSION);
        }
        let r = g.unary(UnaryOpcode::Relu, c).unwrap();
        let r6 = g.clamp(r, f32::NEG_INFINITY, 6.0).unwrap();
        g.output("y", r6).unwrap();
        g
    }

    #[test]
    fn relu_and_clamp_fuse_into_conv() {
        let mut g = conv_relu6(false);
        let pass = Pass::new("fuse").with(LowerRelu).with(FuseClamp);
        let stats = pass.run(&mut g, 100).unwrap();
        assert_eq!(stats.by_rule["lower_relu"], 1);
        assert_eq!(stats.by_rule["fuse_clamp"], 2);

        let (_, op) = feeding(&g, 0);
        let Op::Conv2d(params) = op else {
            panic!("expected a convolution, got {op:?}");
        };
        assert_eq!(params.clamp, ClampRange::new(0.0, 6.0));
        assert_eq!(g.len(), 5);
    }

    #[test]
    fn skip_fusion_is_respected() {
        let mut g = conv_relu6(true);
        let pass = Pass::new("fuse").with(LowerRelu).with(FuseClamp);
        let stats = pass.run(&mut g, 100).unwrap();
        assert_eq!(stats.by_rule.get("fuse_clamp"), None);
        let (_, op) = feeding(&g, 0);
        assert!(matches!(op, Op::Clamp(..)));
    }

    #[test]
    fn matmul_fusion() {
        let mut g = Graph::new();
        let a = g
            .input("a", TensorType::from_dims(DataType::F32, &[2, 3]))
            .unwrap();
        let b = g
            .input("b", TensorType::from_dims(DataType::F32, &[3, 4]))
            .unwrap();
        let m = g.matmul(a, b).unwrap();
        let c = g.clamp(m, -1.0, 1.0).unwrap();
        g.output("y", c).unwrap();

        let stats = Pass::new("fuse").with(FuseClamp).run(&mut g, 100).unwrap();
        assert_eq!(stats.rewrites, 1);
        let (_, op) = feeding(&g, 0);
        assert_eq!(op, Op::MatMul(ClampRange::new(-1.0, 1.0)));
    }
}
