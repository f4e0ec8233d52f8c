use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use log::{error, info, warn};

use csp_workflow::core::config::SearchConfig;
use csp_workflow::engine::external::gulp::GulpRelaxer;
use csp_workflow::engine::relaxer::Relaxer;
use csp_workflow::workflow::{SearchWorkflow, SolverEvent};

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "Crystal structure search driver (EA / RS over GULP relaxations)", long_about = None)]
struct Args {
    /// JSON run configuration. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Search backend ("EA" or "RS")
    #[arg(short, long)]
    algo: Option<String>,

    /// Number of worker threads for parallel relaxations
    #[arg(short, long)]
    threads: Option<usize>,

    /// Generation ceiling
    #[arg(short = 'g', long)]
    max_generations: Option<u32>,

    /// Relaxations submitted per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Directory for run markers and outputs
    #[arg(short, long)]
    work_dir: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<SearchConfig> {
    let mut config = match &args.config {
        Some(path) => SearchConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => SearchConfig::default(),
    };

    if let Some(algo) = &args.algo {
        config.algorithm = algo.clone();
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(max) = args.max_generations {
        config.max_generations = max;
    }
    if let Some(batch) = args.batch_size {
        config.batch_size = batch;
    }
    if let Some(dir) = &args.work_dir {
        config.work_dir = dir.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn check_dependencies(executable: &str) -> Result<()> {
    // `gulp help` fails fast when the binary is not on PATH
    match Command::new(executable).arg("help").output() {
        Ok(_) => Ok(()),
        Err(_) => Err(anyhow!(
            "'{}' executable not found in PATH. Relaxations need GULP; install it or set calculator.executable.",
            executable
        )),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = load_config(&args)?;
    check_dependencies(&config.calculator.executable)?;

    let calc = &config.calculator;
    let relaxer: Arc<dyn Relaxer> = Arc::new(
        GulpRelaxer::new(&calc.executable, &calc.potentials, config.structure.species.clone())?
            .with_pressure(config.target_pressure())
            .with_keywords(calc.keywords.clone()),
    );

    // Rejects unknown backends before any marker is written
    let workflow = SearchWorkflow::from_config(&config, relaxer)?;

    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build_global()
    {
        warn!("Could not size the rayon pool: {}", e);
    }

    let (tx, rx) = unbounded();
    let worker = thread::Builder::new()
        .name("Search-Worker".to_string())
        .spawn(move || workflow.run(tx))?;

    for event in rx {
        match event {
            SolverEvent::Log(msg) => info!("{}", msg),
            SolverEvent::CandidateSkipped(s) => {
                warn!("Gen {}: ID {} skipped ({})", s.generation, s.id, s.reason)
            }
            SolverEvent::GenerationUpdate(stats) => match (stats.best_id, stats.best_energy) {
                (Some(id), Some(e)) => info!(
                    "Gen {} done | {}/{} relaxed | best ID {} at {:.6} eV/atom",
                    stats.generation, stats.relaxed, stats.submitted, id, e
                ),
                _ => info!(
                    "Gen {} done | {}/{} relaxed | no result yet",
                    stats.generation, stats.relaxed, stats.submitted
                ),
            },
            SolverEvent::Finished => break,
            _ => {}
        }
    }

    let report = worker
        .join()
        .map_err(|_| anyhow!("Search worker panicked"))?
        .map_err(|e| {
            error!("Run failed: {}", e);
            e
        })?;

    if let Some((id, row)) = report.results.ranked().first() {
        info!(
            "Best structure: ID {} at {:.6} eV/atom after {} generations ({} submissions)",
            id, row.energy_per_atom, report.final_generation, report.submissions
        );
    }
    Ok(())
}
