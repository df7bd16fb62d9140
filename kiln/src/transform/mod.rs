//! Pattern-match and rewrite infrastructure
//!
//! Every legalization, fusion, and quantization pass is a [`Pass`]: a set of
//! [`Transform`] rules, each registered for the opcodes it can be anchored
//! on.  Running a pass walks the graph in dependency order and offers each
//! node to its rules.  When a rule matches, the engine checks that the
//! matched region is self-contained, lets the rule build a replacement, and
//! then rewires the region's boundary itself.  The walk restarts after every
//! rewrite, and the pass finishes once a full walk finds nothing to do.
//!
//! ```
//! use kiln::graph::{DataType, Graph, Op, TensorType};
//! use kiln::transform::{Pass, rules};
//!
//! let mut g = Graph::new();
//! let x = g.input("x", TensorType::from_dims(DataType::F32, &[2, 3, 4]))?;
//! let a = g.transpose(x, &[1, 2, 0])?;
//! let b = g.transpose(a, &[2, 0, 1])?;
//! g.output("y", b)?;
//!
//! let pass = Pass::new("fold")
//!     .with(rules::FoldTwoTransposes)
//!     .with(rules::FoldNopTranspose);
//! let stats = pass.run(&mut g, 1000)?;
//! assert_eq!(stats.rewrites, 2);
//! assert_eq!(g.len(), 2); // x -> y
//! # Ok::<(), kiln::Error>(())
//! ```
mod pipeline;
pub mod rules;

pub use pipeline::{PassManager, PipelineStats};

use crate::{
    Error,
    graph::{Graph, InputPort, NodeId, Op, Opcode, OutputPort},
};
use log::{debug, info, trace};
use std::collections::{BTreeMap, HashSet};
use std::ops::ControlFlow;

/// The region captured by a successful match
///
/// Rules fill this in from [`Transform::on_try_match`]:
/// - `nodes` lists every interior node of the match
/// - `inputs` lists every input port of an interior node whose producer lies
///   outside the match
/// - `outputs` lists the interior output ports which are read from outside
///   the match; the rule must provide one replacement for each of them, in
///   order
#[derive(Clone, Debug, Default)]
pub struct TransformContext {
    pub nodes: Vec<NodeId>,
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<OutputPort>,
}

/// A [`TransformContext`] which has been checked by the engine
///
/// This can only be built by the engine, so [`Transform::process`] is never
/// called on an unchecked match.
pub struct Match<'a> {
    ctx: &'a TransformContext,
    /// Producers of each boundary input, captured before mutation
    producers: Vec<OutputPort>,
}

impl Match<'_> {
    pub fn context(&self) -> &TransformContext {
        self.ctx
    }

    /// Returns the `i`'th matched node
    pub fn node(&self, i: usize) -> NodeId {
        self.ctx.nodes[i]
    }

    /// Returns the producer of the `i`'th boundary input
    pub fn producer(&self, i: usize) -> OutputPort {
        self.producers[i]
    }
}

/// A single rewrite rule
pub trait Transform {
    /// Name, used in logs and statistics
    fn name(&self) -> &'static str;

    /// Opcodes of the nodes which this rule is anchored on
    fn opcodes(&self) -> &'static [Opcode];

    /// Checks whether the rule applies at `node`, filling in `ctx` if so
    ///
    /// This must not mutate anything; the rule may inspect nodes around the
    /// anchor to build a larger region.
    fn on_try_match(
        &self,
        graph: &Graph,
        node: NodeId,
        ctx: &mut TransformContext,
    ) -> bool;

    /// Builds replacement nodes, returning one output for each of the
    /// match's boundary outputs (in order)
    ///
    /// The replacement may be an existing port outside the match (e.g. the
    /// producer of a boundary input).  Rewiring the consumers is done by the
    /// engine.
    fn process(
        &self,
        graph: &mut Graph,
        m: &Match,
    ) -> Result<Vec<OutputPort>, Error>;
}

/// Checks that a context describes a region which can safely be replaced
///
/// The region must be non-empty, contain no declared output nodes, list
/// exactly its external inputs, and be self-contained: every consumer of an
/// interior output port is either interior or reads a declared boundary
/// output.  It must also be convex (no path leaves the region and comes back
/// in), since rewiring would otherwise close a loop.
pub(crate) fn validate(graph: &Graph, ctx: &TransformContext) -> bool {
    let interior: HashSet<NodeId> = ctx.nodes.iter().copied().collect();
    if interior.is_empty() || interior.len() != ctx.nodes.len() {
        return false;
    }
    let boundary_in: HashSet<InputPort> = ctx.inputs.iter().copied().collect();
    let boundary_out: HashSet<OutputPort> =
        ctx.outputs.iter().copied().collect();
    if boundary_in.len() != ctx.inputs.len()
        || boundary_out.len() != ctx.outputs.len()
        || ctx.outputs.iter().any(|o| !interior.contains(&o.node))
    {
        return false;
    }

    for &n in &ctx.nodes {
        let Ok(node) = graph.node(n) else {
            return false;
        };
        if matches!(node.op(), Op::Output) {
            return false;
        }
        for (i, p) in node.inputs().iter().enumerate() {
            let port = n.input(i);
            let external = match p {
                Some(p) => !interior.contains(&p.node),
                None => return false,
            };
            if external != boundary_in.contains(&port) {
                return false;
            }
        }
        for i in 0..node.output_count() {
            let out = n.output(i);
            if boundary_out.contains(&out) {
                continue;
            }
            let Ok(consumers) = graph.consumers(out) else {
                return false;
            };
            if consumers.iter().any(|c| !interior.contains(&c.node)) {
                return false;
            }
        }
    }

    // Convexity: no boundary producer may depend on the region itself
    for port in &ctx.inputs {
        let Ok(Some(p)) = graph.producer(*port) else {
            return false;
        };
        if ctx.nodes.iter().any(|&n| graph.depends_on(p.node, n)) {
            return false;
        }
    }
    true
}

/// Number of rewrites performed by a single pass
#[derive(Clone, Debug, Default)]
pub struct PassStats {
    /// Total rewrites
    pub rewrites: usize,
    /// Rewrites, broken down by rule name
    pub by_rule: BTreeMap<&'static str, usize>,
    /// Nodes removed by dead code elimination
    pub removed: usize,
}

/// A named set of rewrite rules, run together until none of them applies
#[derive(Default)]
pub struct Pass {
    name: String,
    rules: Vec<Box<dyn Transform>>,
    by_opcode: BTreeMap<Opcode, Vec<usize>>,
}

impl Pass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Registers a rule, returning the pass (builder style)
    pub fn with<T: Transform + 'static>(mut self, rule: T) -> Self {
        self.add(Box::new(rule));
        self
    }

    /// Registers a rule
    ///
    /// Rules are tried in registration order.
    pub fn add(&mut self, rule: Box<dyn Transform>) {
        let index = self.rules.len();
        for op in rule.opcodes() {
            self.by_opcode.entry(*op).or_default().push(index);
        }
        self.rules.push(rule);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the registered rules, in order
    pub fn rule_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|r| r.name())
    }

    /// Finds the first node (in dependency order) with a validated match
    fn find_match(&self, graph: &Graph) -> Option<(usize, TransformContext)> {
        graph.walk(|node| {
            let Some(op) = graph.get_op(node) else {
                return ControlFlow::Continue(());
            };
            let Some(rules) = self.by_opcode.get(&op.opcode()) else {
                return ControlFlow::Continue(());
            };
            for &r in rules {
                let rule = &self.rules[r];
                let mut ctx = TransformContext::default();
                if !rule.on_try_match(graph, node, &mut ctx) {
                    continue;
                }
                if validate(graph, &ctx) {
                    return ControlFlow::Break((r, ctx));
                }
                trace!(
                    "rule `{}` matched at {node:?} but the region is not \
                     self-contained",
                    rule.name()
                );
            }
            ControlFlow::Continue(())
        })
    }

    /// Applies a validated match, rewiring the boundary outputs
    fn apply(
        &self,
        graph: &mut Graph,
        rule: &dyn Transform,
        ctx: &TransformContext,
    ) -> Result<(), Error> {
        let producers = ctx
            .inputs
            .iter()
            .map(|p| graph.connected_producer(*p))
            .collect::<Result<Vec<_>, _>>()?;
        let m = Match { ctx, producers };
        let replacements = rule.process(graph, &m)?;
        if replacements.len() != ctx.outputs.len() {
            return Err(Error::BadReplacement(rule.name()));
        }
        for (old, new) in ctx.outputs.iter().zip(&replacements) {
            if graph.output_type(*old)? != graph.output_type(*new)? {
                return Err(Error::BadReplacement(rule.name()));
            }
        }
        for (old, new) in ctx.outputs.iter().zip(replacements) {
            graph.replace_uses(*old, new)?;
        }
        Ok(())
    }

    /// Runs the pass to a fixpoint, removing orphaned nodes as it goes
    ///
    /// Returns [`Error::PassDiverged`] if more than `max_rewrites` rewrites
    /// are performed.
    pub fn run(
        &self,
        graph: &mut Graph,
        max_rewrites: usize,
    ) -> Result<PassStats, Error> {
        let mut stats = PassStats::default();
        while let Some((r, ctx)) = self.find_match(graph) {
            if stats.rewrites == max_rewrites {
                return Err(Error::PassDiverged(self.name.clone(), max_rewrites));
            }
            let rule = self.rules[r].as_ref();
            debug!(
                "[{}] applying `{}` at `{}`",
                self.name,
                rule.name(),
                graph.node(ctx.nodes[0])?.name()
            );
            self.apply(graph, rule, &ctx)?;
            stats.rewrites += 1;
            *stats.by_rule.entry(rule.name()).or_default() += 1;

            // Sweep the replaced region, so that consumer sets stay exact
            // for the next round of matching
            stats.removed += graph.dce();
        }
        stats.removed += graph.dce();
        if stats.rewrites > 0 {
            info!(
                "pass `{}` converged after {} rewrites ({} nodes removed)",
                self.name, stats.rewrites, stats.removed
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{DataType, TensorType, UnaryOpcode};

    /// Rewrites `abs(x)` into `neg(x)`, claiming only the `abs` node
    struct LeakyRule;
    impl Transform for LeakyRule {
        fn name(&self) -> &'static str {
            "leaky"
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
            let Some(Op::Unary(UnaryOpcode::Exp)) = graph.get_op(node) else {
                return false;
            };
            // Claims the producer as interior, but forgets that it has
            // other consumers
            let Ok(p) = graph.connected_producer(node.input(0)) else {
                return false;
            };
            ctx.nodes = vec![p.node, node];
            ctx.inputs = vec![p.node.input(0)];
            ctx.outputs = vec![node.output(0)];
            true
        }
        fn process(
            &self,
            graph: &mut Graph,
            m: &Match,
        ) -> Result<Vec<OutputPort>, Error> {
            Ok(vec![graph.unary(UnaryOpcode::Neg, m.producer(0))?])
        }
    }

    #[test]
    fn rejects_leaky_match() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[4]))
            .unwrap();
        let a = g.unary(UnaryOpcode::Abs, x).unwrap();
        let e = g.unary(UnaryOpcode::Exp, a).unwrap();
        let s = g.unary(UnaryOpcode::Sqrt, a).unwrap();
        g.output("e", e).unwrap();
        g.output("s", s).unwrap();

        let pass = Pass::new("leaky").with(LeakyRule);
        let stats = pass.run(&mut g, 10).unwrap();
        assert_eq!(stats.rewrites, 0);
        assert_eq!(g.len(), 6);
        assert!(g.contains(a.node));
    }

    #[test]
    fn accepts_contained_match() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[4]))
            .unwrap();
        let a = g.unary(UnaryOpcode::Abs, x).unwrap();
        let e = g.unary(UnaryOpcode::Exp, a).unwrap();
        g.output("e", e).unwrap();

        let pass = Pass::new("leaky").with(LeakyRule);
        let stats = pass.run(&mut g, 10).unwrap();
        assert_eq!(stats.rewrites, 1);
        assert_eq!(stats.removed, 2);
        let out = g.outputs()[0];
        let p = g.connected_producer(out.input(0)).unwrap();
        assert_eq!(g.get_op(p.node), Some(&Op::Unary(UnaryOpcode::Neg)));
    }

    #[test]
    fn validate_convexity() {
        // x -> a -> b -> c, with a -> c as well; {a, c} is not convex
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[4]))
            .unwrap();
        let a = g.unary(UnaryOpcode::Abs, x).unwrap();
        let b = g.unary(UnaryOpcode::Neg, a).unwrap();
        let c = g.binary(crate::graph::BinaryOpcode::Add, a, b).unwrap();
        g.output("c", c).unwrap();

        let ctx = TransformContext {
            nodes: vec![a.node, c.node],
            inputs: vec![a.node.input(0), c.node.input(1)],
            outputs: vec![a, c],
        };
        assert!(!validate(&g, &ctx));

        let ctx = TransformContext {
            nodes: vec![a.node, b.node, c.node],
            inputs: vec![a.node.input(0)],
            outputs: vec![c],
        };
        assert!(validate(&g, &ctx));

        // Missing a boundary input
        let ctx = TransformContext {
            nodes: vec![a.node, b.node, c.node],
            inputs: vec![],
            outputs: vec![c],
        };
        assert!(!validate(&g, &ctx));
    }

    /// A rule which never converges
    struct Spin;
    impl Transform for Spin {
        fn name(&self) -> &'static str {
            "spin"
        }
        fn opcodes(&self) -> &'static [Opcode] {
            &[Opcode::Unary]
        }
        fn on_try_match(
            &self,
            _graph: &Graph,
            node: NodeId,
            ctx: &mut TransformContext,
        ) -> bool {
            ctx.nodes = vec![node];
            ctx.inputs = vec![node.input(0)];
            ctx.outputs = vec![node.output(0)];
            true
        }
        fn process(
            &self,
            graph: &mut Graph,
            m: &Match,
        ) -> Result<Vec<OutputPort>, Error> {
            Ok(vec![graph.unary(UnaryOpcode::Abs, m.producer(0))?])
        }
    }

    #[test]
    fn divergence_is_an_error() {
        let mut g = Graph::new();
        let x = g
            .input("x", TensorType::from_dims(DataType::F32, &[4]))
            .unwrap();
        let a = g.unary(UnaryOpcode::Abs, x).unwrap();
        g.output("a", a).unwrap();
        let pass = Pass::new("spin").with(Spin);
        assert!(matches!(
            pass.run(&mut g, 8),
            Err(Error::PassDiverged(_, 8))
        ));
    }
}
