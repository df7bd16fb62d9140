//! Dependency-order traversal
use super::{Graph, NodeId};
use std::collections::HashSet;
use std::ops::ControlFlow;

impl Graph {
    /// Walks the graph from its declared outputs, calling `f` on each node
    /// after all of its producers have been visited.
    ///
    /// Each reachable node is visited exactly once, so shared subgraphs are
    /// handled in `O(nodes + edges)`.  Unconnected inputs are skipped.  The
    /// walk stops early if `f` returns [`ControlFlow::Break`], in which case
    /// the break value is returned.
    ///
    /// `f` only gets a node handle; since the walk borrows the graph, it
    /// can't be mutated until the walk is finished.
    pub fn walk<B, F>(&self, mut f: F) -> Option<B>
    where
        F: FnMut(NodeId) -> ControlFlow<B>,
    {
        // Depth-first recursion on the heap, to protect against stack overflows
        enum Action {
            Down,
            Up,
        }

        let mut todo: Vec<(Action, NodeId)> = self
            .outputs
            .iter()
            .rev()
            .map(|n| (Action::Down, *n))
            .collect();
        let mut seen = HashSet::new();
        while let Some((action, node)) = todo.pop() {
            match action {
                Action::Down => {
                    if !seen.insert(node) {
                        continue;
                    }
                    let Ok(n) = self.node(node) else {
                        continue;
                    };
                    todo.push((Action::Up, node));
                    // Reversed, so that input 0 is visited first
                    let children: Vec<_> = n.producers().collect();
                    todo.extend(
                        children
                            .into_iter()
                            .rev()
                            .filter(|c| !seen.contains(&c.node))
                            .map(|c| (Action::Down, c.node)),
                    );
                }
                Action::Up => {
                    if let ControlFlow::Break(b) = f(node) {
                        return Some(b);
                    }
                }
            }
        }
        None
    }

    /// Returns every reachable node in dependency order
    pub fn postorder(&self) -> Vec<NodeId> {
        let mut out = vec![];
        self.walk::<(), _>(|n| {
            out.push(n);
            ControlFlow::Continue(())
        });
        out
    }
}

#[cfg(test)]
mod test {
    use crate::graph::*;
    use std::collections::HashMap;
    use std::ops::ControlFlow;

    fn f32s(dims: &[usize]) -> TensorType {
        TensorType::from_dims(DataType::F32, dims)
    }

    #[test]
    fn producers_before_consumers() {
        let mut g = Graph::new();
        let x = g.input("x", f32s(&[4])).unwrap();
        let y = g.input("y", f32s(&[4])).unwrap();
        let a = g.binary(BinaryOpcode::Add, x, y).unwrap();
        let b = g.unary(UnaryOpcode::Abs, a).unwrap();
        let c = g.binary(BinaryOpcode::Mul, a, b).unwrap();
        g.output("c", c).unwrap();

        let order = g.postorder();
        assert_eq!(order.len(), 6);
        let pos: HashMap<_, _> =
            order.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        for &n in &order {
            for p in g.node(n).unwrap().producers() {
                assert!(pos[&p.node] < pos[&n]);
            }
        }
        // Inputs are visited in port order
        assert_eq!(order[0], x.node);
        assert_eq!(order[1], y.node);
    }

    #[test]
    fn diamonds_are_linear() {
        // A chain of diamonds would take exponential time without memoization
        let mut g = Graph::new();
        let mut v = g.input("x", f32s(&[1])).unwrap();
        for _ in 0..64 {
            let a = g.unary(UnaryOpcode::Abs, v).unwrap();
            let b = g.unary(UnaryOpcode::Neg, v).unwrap();
            v = g.binary(BinaryOpcode::Add, a, b).unwrap();
        }
        g.output("out", v).unwrap();

        let mut visits = 0;
        g.walk::<(), _>(|_| {
            visits += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(visits, g.len());
    }

    #[test]
    fn early_exit() {
        let mut g = Graph::new();
        let x = g.input("x", f32s(&[4])).unwrap();
        let a = g.unary(UnaryOpcode::Abs, x).unwrap();
        let b = g.unary(UnaryOpcode::Neg, a).unwrap();
        g.output("b", b).unwrap();

        let found = g.walk(|n| {
            if matches!(g.get_op(n), Some(Op::Unary(UnaryOpcode::Abs))) {
                ControlFlow::Break(n)
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(found, Some(a.node));
    }
}
