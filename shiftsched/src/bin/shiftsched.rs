use anyhow::{ensure, Context};
use tracing_subscriber::EnvFilter;

use shiftsched::*;
use shiftsched::{
    algo::{RotationTermination, Settings, TransitiveClosureOptimizations, from_cache},
    analyze::{GraphStats, is_schedulable},
    cache::{InMemoryScheduleCache, ScheduleCache},
    serial::{JsonGraphParser, ScheduleReport},
};

/// A memory-aware scheduler for DAGs of ops
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a JSON graph
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    input:          PathBuf,

    /// How the initial schedule breaks ties
    #[arg(short, long, value_enum, default_value_t = KahnTieBreaker::Greedy)]
    tie_breaker:    KahnTieBreaker,

    /// Seed of every random choice
    #[arg(short, long, default_value_t = 0)]
    seed:           u64,

    /// Wall-clock budget of the rotation search, in seconds
    #[arg(long, default_value_t = f64::MAX)]
    max_seconds:    f64,

    /// Maximum number of committed rotations (0 keeps the initial schedule)
    #[arg(long, default_value_t = i64::MAX)]
    max_rotations:  i64,

    /// How rotation costs are computed
    #[arg(short, long, value_enum, default_value_t = RotationAlgo::Ripple)]
    algo:           RotationAlgo,

    /// Cross-check every rotation
    #[arg(short, long, value_enum, default_value_t = DebugMode::Off)]
    debug_mode:     DebugMode,

    /// Skip the graph rewrites run before scheduling
    #[arg(long, default_value_t = false)]
    no_optimize:    bool,

    /// Maximum number of graph rewrite rounds
    #[arg(long, default_value_t = usize::MAX)]
    max_iterations: usize,

    /// Solve the graph twice through an in-memory cache, to exercise it
    #[arg(long, default_value_t = false)]
    twice:          bool,

    /// What to print
    #[arg(short, long, value_enum, default_value_t = OutputKind::Table)]
    output:         OutputKind,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shiftsched=info"))
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Args::parse();
    ensure!(cli.input.is_file(), "Invalid input path {}", cli.input.display());
    let graph = read_from_path::<JsonGraphParser>(cli.input.clone())
        .with_context(|| format!("reading {}", cli.input.display()))?;
    info!(stats = %GraphStats::new(&graph), "graph read");
    ensure!(is_schedulable(&graph), "The graph has no valid schedule");

    let tcos = if cli.no_optimize {
        TransitiveClosureOptimizations::all_off()
    } else {
        TransitiveClosureOptimizations::all_on()
    }.with_max_iterations(cli.max_iterations);
    let settings = Settings {
        kahn_decider:           KahnDecider::new(cli.tie_breaker),
        tcos,
        rotation_termination:   RotationTermination::new(cli.max_seconds, cli.max_rotations),
        rotation_algo:          cli.algo,
        seed:                   cli.seed,
        debug_mode:             cli.debug_mode,
    };

    let cache = InMemoryScheduleCache::new();
    let c = Some(&cache as &dyn ScheduleCache);
    let mut sg = from_cache(graph.clone(), &settings, c, c)?;
    if cli.twice {
        sg = from_cache(graph, &settings, c, c)?;
        ensure!(sg.is_from_cache(), "Solving the same graph twice missed the cache");
    }

    let report = ScheduleReport::new(&sg)?;
    println!("{}", report.render(&sg, cli.output)?);

    Ok(())
}
