use crate::cli::SieveArgs;
use crate::config::{PartialSieveConfig, RunConfig};
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use cryosieve::engine::distributed::{LaunchMode, connect_from_env};
use cryosieve::engine::error::EngineError;
use cryosieve::engine::progress::ProgressReporter;
use cryosieve::workflows::sieve::{self, SieveOutcome};
use tracing::{info, warn};

pub fn run(args: SieveArgs, threads: Option<usize>) -> Result<()> {
    let partial_config = match &args.config {
        Some(path) => PartialSieveConfig::from_file(path)?,
        None => PartialSieveConfig::default(),
    };
    info!("Merging configuration from file and CLI arguments...");
    let config = partial_config.merge_with_cli(&args)?;
    let threads = threads.unwrap_or(0);

    let launch_mode = LaunchMode::from_env().map_err(EngineError::from)?;
    let outcome = match launch_mode {
        LaunchMode::Standalone => run_standalone(&config, threads)?,
        LaunchMode::Distributed { rank, world_size } => {
            if config.num_workers > 1 {
                warn!(
                    "Ignoring --num-workers {}; this process is rank {} of a group of {}.",
                    config.num_workers, rank, world_size
                );
            }
            match run_distributed(&config, threads)? {
                Some(outcome) => outcome,
                None => {
                    info!(rank, "Worker finished; the controller writes the outputs.");
                    return Ok(());
                }
            }
        }
    };

    print_summary(&outcome);
    Ok(())
}

fn run_standalone(config: &RunConfig, threads: usize) -> Result<SieveOutcome> {
    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!(
        "Sieving particles with {} worker(s)...",
        config.num_workers
    );
    info!("Invoking the core sieve workflow...");
    Ok(sieve::run_local_group(
        &config.sieve,
        config.num_workers,
        threads,
        &reporter,
    )?)
}

fn run_distributed(config: &RunConfig, threads: usize) -> Result<Option<SieveOutcome>> {
    let (context, mut collective) = connect_from_env(threads).map_err(EngineError::from)?;
    info!(
        rank = context.rank(),
        world_size = context.world_size(),
        "Joined distributed group."
    );

    let progress_handler = CliProgressHandler::new();
    let reporter = if context.is_controller() {
        println!(
            "Sieving particles with a group of {} worker(s)...",
            context.world_size()
        );
        ProgressReporter::with_callback(progress_handler.get_callback())
    } else {
        ProgressReporter::new()
    };

    sieve::run(&config.sieve, &context, collective.as_mut(), &reporter).map_err(CliError::from)
}

fn print_summary(outcome: &SieveOutcome) {
    for half_set in &outcome.half_sets {
        println!(
            "  Half-set {}: retained {} of {} particles",
            half_set.half_set,
            half_set.retained_count(),
            half_set.rows.len()
        );
    }
    println!(
        "✓ {} retained particles written to: {}",
        outcome.retained.len(),
        outcome.retained_path.display()
    );
    println!(
        "  {} sieved-out particles written to: {}",
        outcome.sieved.len(),
        outcome.sieved_path.display()
    );
}
