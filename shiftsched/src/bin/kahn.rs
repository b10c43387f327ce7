use anyhow::{ensure, Context};
use tracing_subscriber::EnvFilter;

use shiftsched::*;
use shiftsched::{
    algo::ScheduledGraph,
    kahn::kahn,
    serial::{JsonGraphParser, ScheduleReport},
};

/// The initial schedule only, without any rewriting or rotation
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a JSON graph
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    input:          PathBuf,

    /// How ties are broken
    #[arg(short, long, value_enum, default_value_t = KahnTieBreaker::Greedy)]
    tie_breaker:    KahnTieBreaker,

    /// Seed of the random tie-breaker
    #[arg(short, long, default_value_t = 0)]
    seed:           u64,

    /// What to print
    #[arg(short, long, value_enum, default_value_t = OutputKind::Schedule)]
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

    let start = Instant::now();
    let schedule = kahn(&graph, &KahnDecider::new(cli.tie_breaker), cli.seed, ErrorIfCycle::Yes)?;
    info!(elapsed_us = start.elapsed().as_micros() as u64, tie_breaker = %cli.tie_breaker, "kahn done");

    let sg = ScheduledGraph::from_schedule(graph, schedule)?;
    let report = ScheduleReport::new(&sg)?;
    println!("{}", report.render(&sg, cli.output)?);

    Ok(())
}
