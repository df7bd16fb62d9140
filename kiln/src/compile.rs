//! End-to-end compilation: rewrite, legality check, and scheduling
use crate::{
    Error,
    graph::Graph,
    schedule::{Schedule, optimize, schedule, verify},
    target::{Target, check_supported},
    transform::{PassManager, PipelineStats},
};
use log::info;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Knobs for [`compile`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Maximum number of rounds through the target's pass list
    pub max_rounds: usize,
    /// Rewrites allowed in a single pass before it is considered divergent
    pub max_rewrites_per_pass: usize,
    /// Time budget for buffer re-placement; `None` skips it entirely
    pub optimize_budget: Option<Duration>,
    /// Seed for the re-placement search
    pub optimize_seed: u64,
    /// Check the greedy schedule for overlapping buffers
    pub verify: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_rounds: 16,
            max_rewrites_per_pass: 100_000,
            optimize_budget: None,
            optimize_seed: 0x6b696c6e,
            verify: cfg!(debug_assertions),
        }
    }
}

/// Result of a successful compilation
pub struct Compiled {
    /// The rewritten graph
    pub graph: Graph,
    /// Execution order and buffer placement for `graph`
    pub schedule: Schedule,
    /// Rewrite statistics
    pub passes: PipelineStats,
}

/// Compiles a graph for the given target
///
/// Passes are run until they converge (or the round budget runs out), then
/// every remaining node is checked against the target, and finally buffers
/// are scheduled.  Re-placed schedules are always checked for overlaps.
///
/// ```
/// use kiln::{CompileOptions, compile, graph::Graph, target::CpuTarget};
///
/// let txt = "
/// x input f32 4,4
/// a transpose x 1,0
/// b transpose a 1,0
/// y relu b
/// out output y
/// ";
/// let g = Graph::from_text(txt.as_bytes())?;
/// let c = compile(g, &CpuTarget, &CompileOptions::default())?;
/// // Both transposes fold away; the ReLU becomes a clamp
/// assert_eq!(c.schedule.compute_sequence.len(), 3);
/// # Ok::<(), kiln::Error>(())
/// ```
pub fn compile(
    mut graph: Graph,
    target: &dyn Target,
    opts: &CompileOptions,
) -> Result<Compiled, Error> {
    if graph.outputs().is_empty() {
        return Err(Error::EmptyGraph);
    }
    let removed = graph.dce();
    if removed > 0 {
        info!("removed {removed} unreachable nodes before compiling");
    }

    let passes = PassManager::new(
        target.passes(),
        opts.max_rounds,
        opts.max_rewrites_per_pass,
    )
    .run(&mut graph)?;
    check_supported(&graph, target)?;

    let allocators = target.allocators();
    let capacities = allocators.capacities();
    let mut schedule = schedule(&graph, allocators)?;
    if opts.verify {
        verify(&graph, &schedule)?;
    }
    if let Some(budget) = opts.optimize_budget {
        if optimize(&mut schedule, &capacities, budget, opts.optimize_seed) {
            verify(&graph, &schedule)?;
        }
    }
    info!(
        "compiled {} nodes for `{}` in {} rounds",
        schedule.compute_sequence.len(),
        target.name(),
        passes.rounds
    );
    Ok(Compiled {
        graph,
        schedule,
        passes,
    })
}
