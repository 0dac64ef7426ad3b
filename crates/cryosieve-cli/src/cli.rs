use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "CryoSieve CLI - Sieve cryo-EM particle stacks by their agreement with half-set reconstructions.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Total number of compute threads shared by all devices.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Score every particle against its half-set reference and keep the best-agreeing fraction.
    Sieve(SieveArgs),
    /// Summarise a particle metadata file without scoring it.
    Inspect(InspectArgs),
}

/// How half-sets of unequal size are reconciled.
#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceMode {
    /// Each half-set keeps its own retained count.
    None,
    /// Retained counts are clamped to the smallest half-set's count.
    Clamp,
    /// Half-sets are randomly down-sampled to equal size before scoring.
    Resample,
}

/// Arguments for the `sieve` subcommand.
#[derive(Args, Debug)]
pub struct SieveArgs {
    // --- Core Arguments ---
    /// Path to the input particle metadata file (STAR).
    #[arg(short, long, required = true, value_name = "PATH")]
    pub input: PathBuf,

    /// Path of the retained particles. Sieved-out particles are written next
    /// to it with a `_sieved` suffix.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub output: PathBuf,

    /// Optional configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    // --- Input Overrides ---
    /// Directory that image stack paths in the metadata are relative to.
    #[arg(short, long, value_name = "PATH")]
    pub directory: Option<PathBuf>,

    /// Pixel size in Angstroms, for metadata that does not carry one.
    #[arg(long, value_name = "FLOAT")]
    pub angpix: Option<f64>,

    /// Reference volume of each half-set, in ascending half-set order.
    #[arg(long = "volume", value_name = "PATH", num_args(1..))]
    pub volumes: Vec<PathBuf>,

    /// Mask multiplied into every reference volume.
    #[arg(long, value_name = "PATH")]
    pub mask: Option<PathBuf>,

    // --- Selection Overrides ---
    /// Fraction of each half-set to retain, in (0, 1].
    #[arg(short, long, value_name = "FLOAT")]
    pub retention_ratio: Option<f64>,

    /// High-pass cutoff resolution in Angstroms.
    #[arg(short = 'f', long, alias = "frequency", value_name = "ANGSTROMS")]
    pub cutoff_resolution: Option<f64>,

    /// Strategy for half-sets of unequal size.
    #[arg(short, long, value_enum, value_name = "MODE")]
    pub balance: Option<BalanceMode>,

    /// Seed of the random down-sampling used by `--balance resample`.
    #[arg(long, value_name = "INT")]
    pub seed: Option<u64>,

    /// Write per-particle scores to a CSV file.
    #[arg(long, value_name = "PATH")]
    pub scores: Option<PathBuf>,

    // --- Execution Overrides ---
    /// Number of in-process workers, one device each. Ignored when RANK and
    /// WORLD_SIZE place this process in a distributed group.
    #[arg(short = 'n', long, value_name = "INT")]
    pub num_workers: Option<usize>,

    /// Images scored per kernel invocation.
    #[arg(long, value_name = "INT")]
    pub batch_size: Option<usize>,

    /// Threads reading particle images ahead of scoring.
    #[arg(long, value_name = "INT")]
    pub loader_threads: Option<usize>,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S selection.retention-ratio=0.9
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `inspect` subcommand.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Path to the particle metadata file (STAR).
    #[arg(required = true, value_name = "PATH")]
    pub input: PathBuf,

    /// Pixel size in Angstroms, for metadata that does not carry one.
    #[arg(long, value_name = "FLOAT")]
    pub angpix: Option<f64>,

    /// Directory that image stack paths in the metadata are relative to.
    #[arg(short, long, value_name = "PATH")]
    pub directory: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sieve_accepts_one_volume_per_half_set() {
        let cli = Cli::parse_from([
            "cryosieve",
            "-vv",
            "sieve",
            "-i",
            "in.star",
            "-o",
            "out.star",
            "--volume",
            "half1.mrc",
            "half2.mrc",
            "--frequency",
            "40",
            "--balance",
            "clamp",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Sieve(args) = cli.command else {
            panic!("Expected 'sieve' subcommand");
        };
        assert_eq!(
            args.volumes,
            vec![PathBuf::from("half1.mrc"), PathBuf::from("half2.mrc")]
        );
        assert_eq!(args.cutoff_resolution, Some(40.0));
        assert_eq!(args.balance, Some(BalanceMode::Clamp));
        assert!(args.config.is_none());
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["cryosieve", "-q", "-v", "inspect", "in.star"]);
        assert!(result.is_err());
    }
}
