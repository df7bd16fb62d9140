use super::Pass;
use crate::{Error, graph::Graph};
use log::{info, warn};

/// Summary of a [`PassManager`] run
#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    /// Number of rounds executed (each round runs every pass once)
    pub rounds: usize,
    /// Whether the final round made no changes
    pub converged: bool,
    /// Total rewrites, per pass name, in pass order
    pub rewrites: Vec<(String, usize)>,
    /// Total nodes removed by dead code elimination
    pub removed: usize,
}

impl PipelineStats {
    pub fn total_rewrites(&self) -> usize {
        self.rewrites.iter().map(|(_, n)| n).sum()
    }
}

/// An ordered list of passes, run in rounds until none of them changes the
/// graph
pub struct PassManager {
    passes: Vec<Pass>,
    max_rounds: usize,
    max_rewrites_per_pass: usize,
}

impl PassManager {
    pub fn new(
        passes: Vec<Pass>,
        max_rounds: usize,
        max_rewrites_per_pass: usize,
    ) -> Self {
        Self {
            passes,
            max_rounds,
            max_rewrites_per_pass,
        }
    }

    /// Names of the passes, in execution order
    pub fn pass_names(&self) -> impl Iterator<Item = &str> {
        self.passes.iter().map(|p| p.name())
    }

    /// Runs every pass in order, repeating until a full round performs no
    /// rewrites or the round budget is exhausted
    ///
    /// Running out of rounds is not an error; the graph is still valid, and
    /// [`PipelineStats::converged`] is `false`.
    pub fn run(&self, graph: &mut Graph) -> Result<PipelineStats, Error> {
        let mut stats = PipelineStats {
            rewrites: self
                .passes
                .iter()
                .map(|p| (p.name().to_owned(), 0))
                .collect(),
            ..PipelineStats::default()
        };
        while stats.rounds < self.max_rounds {
            stats.rounds += 1;
            let mut changed = false;
            for (pass, total) in self.passes.iter().zip(&mut stats.rewrites) {
                let s = pass.run(graph, self.max_rewrites_per_pass)?;
                total.1 += s.rewrites;
                stats.removed += s.removed;
                changed |= s.rewrites > 0;
            }
            if !changed {
                stats.converged = true;
                break;
            }
        }
        if stats.converged {
            info!(
                "pipeline converged after {} rounds ({} rewrites)",
                stats.rounds,
                stats.total_rewrites()
            );
        } else {
            warn!(
                "pipeline stopped after {} rounds without converging",
                stats.rounds
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{DataType, TensorType};
    use crate::transform::rules::*;

    fn transposes(g: &mut Graph, n: usize) {
        let mut v = g
            .input("x", TensorType::from_dims(DataType::F32, &[2, 3]))
            .unwrap();
        for _ in 0..n {
            v = g.transpose(v, &[1, 0]).unwrap();
        }
        g.output("y", v).unwrap();
    }

    #[test]
    fn rounds_until_fixpoint() {
        let mut g = Graph::new();
        transposes(&mut g, 4);
        // Each pass only knows one rule, so alternating is required
        let pm = PassManager::new(
            vec![
                Pass::new("nop").with(FoldNopTranspose),
                Pass::new("fold").with(FoldTwoTransposes),
            ],
            16,
            1000,
        );
        let stats = pm.run(&mut g).unwrap();
        assert!(stats.converged);
        assert_eq!(g.len(), 2);
        assert_eq!(stats.rewrites[0].0, "nop");
        assert!(stats.rewrites[0].1 > 0);
        assert!(stats.rewrites[1].1 > 0);
        // One more round to observe that nothing changed
        assert_eq!(stats.rounds, 3);
    }

    #[test]
    fn round_budget() {
        let mut g = Graph::new();
        transposes(&mut g, 4);
        let pm = PassManager::new(
            vec![
                Pass::new("nop").with(FoldNopTranspose),
                Pass::new("fold").with(FoldTwoTransposes),
            ],
            1,
            1000,
        );
        let stats = pm.run(&mut g).unwrap();
        assert!(!stats.converged);
        assert_eq!(stats.rounds, 1);
    }
}
