use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::info;
use strum::IntoEnumIterator;

use kiln::{
    CompileOptions,
    graph::{Graph, MemoryKind},
    target::{AccelTarget, CpuTarget, Target},
};

/// Compiles a network in text format and reports its schedule
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Input file
    #[clap(short, long)]
    input: PathBuf,

    /// Compilation target
    #[clap(short, long, value_enum, default_value_t = TargetKind::Cpu)]
    target: TargetKind,

    /// Accelerator scratchpad size, in bytes
    #[clap(long)]
    scratchpad: Option<usize>,

    /// Maximum number of rounds through the pass list
    #[clap(long, default_value_t = 16)]
    max_rounds: usize,

    /// Time budget for buffer re-placement, in milliseconds
    #[clap(long)]
    optimize_ms: Option<u64>,

    /// Check the schedule for overlapping buffers
    #[clap(long)]
    verify: bool,

    /// Name of a file to write the schedule into (bincode)
    #[clap(short, long)]
    out: Option<PathBuf>,

    /// Name of a `.dot` file to write the rewritten graph into
    #[clap(long)]
    dot: Option<PathBuf>,
}

#[derive(ValueEnum, Clone)]
enum TargetKind {
    Cpu,
    Accel,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let now = Instant::now();
    let args = Args::parse();
    let file = std::fs::File::open(&args.input)?;
    let graph = Graph::from_text(file)?;
    info!("Loaded {} nodes in {:?}", graph.len(), now.elapsed());

    let target: Box<dyn Target> = match args.target {
        TargetKind::Cpu => Box::new(CpuTarget),
        TargetKind::Accel => {
            let mut t = AccelTarget::default();
            if let Some(s) = args.scratchpad {
                t.scratchpad = s;
            }
            Box::new(t)
        }
    };
    let opts = CompileOptions {
        max_rounds: args.max_rounds,
        optimize_budget: args.optimize_ms.map(Duration::from_millis),
        verify: args.verify || CompileOptions::default().verify,
        ..CompileOptions::default()
    };

    let start = Instant::now();
    let compiled = kiln::compile(graph, target.as_ref(), &opts)?;
    info!("Compiled in {:?}", start.elapsed());

    for (pass, n) in &compiled.passes.rewrites {
        info!("  {pass}: {n} rewrites");
    }
    for kind in MemoryKind::iter() {
        let used = compiled.schedule.max_usage[kind];
        if used > 0 {
            info!(
                "  {kind}: {used} bytes ({} peak live)",
                compiled.schedule.peak_live[kind]
            );
        }
    }

    if let Some(out) = args.out {
        let bytes = bincode::serialize(&compiled.schedule)?;
        std::fs::write(&out, bytes)?;
        info!("Wrote schedule to {out:?}");
    }
    if let Some(dot) = args.dot {
        std::fs::write(&dot, compiled.graph.dot())?;
        info!("Wrote graph to {dot:?}");
    }
    Ok(())
}
