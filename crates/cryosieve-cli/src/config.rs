use crate::cli::{BalanceMode, SieveArgs};
use crate::error::{CliError, Result};
use cryosieve::engine::config::{self as core_config, BalanceStrategy, SieveConfigBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Seed of the down-sampling used by `balance = "resample"` when none is given.
pub const DEFAULT_SEED: u64 = 0;

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialInputConfig {
    directory: Option<PathBuf>,
    angpix: Option<f64>,
    volumes: Option<Vec<PathBuf>>,
    mask: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialSelectionConfig {
    retention_ratio: Option<f64>,
    cutoff_resolution: Option<f64>,
    balance: Option<BalanceMode>,
    seed: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialOutputConfig {
    scores: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialExecutionConfig {
    num_workers: Option<usize>,
    batch_size: Option<usize>,
    loader_threads: Option<usize>,
}

/// Settings read from a TOML file, every field optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialSieveConfig {
    input: Option<PartialInputConfig>,
    selection: Option<PartialSelectionConfig>,
    output: Option<PartialOutputConfig>,
    execution: Option<PartialExecutionConfig>,
}

/// The merged configuration of one `sieve` invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub sieve: core_config::SieveConfig,
    /// In-process workers used when the process is not part of a distributed group.
    pub num_workers: usize,
}

fn parse_value<T: FromStr>(key: &str, value: &str, kind: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid {} value for {}: {}", kind, key, value)))
}

impl PartialSieveConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolves the final configuration. Command-line values win over `-S`
    /// overrides, which win over the file.
    pub fn merge_with_cli(mut self, args: &SieveArgs) -> Result<RunConfig> {
        self.apply_set_values(&args.set_values)?;

        let input = self.input.take().unwrap_or_default();
        let selection = self.selection.take().unwrap_or_default();
        let output = self.output.take().unwrap_or_default();
        let execution = self.execution.take().unwrap_or_default();

        let volumes = if args.volumes.is_empty() {
            input.volumes.unwrap_or_default()
        } else {
            args.volumes.clone()
        };
        if volumes.is_empty() {
            return Err(CliError::Config(
                "At least one reference volume is required, via `--volume` or `input.volumes`."
                    .to_string(),
            ));
        }

        let retention_ratio = args
            .retention_ratio
            .or(selection.retention_ratio)
            .ok_or_else(|| {
                CliError::Config(
                    "`selection.retention-ratio` is required (or pass `--retention-ratio`)."
                        .to_string(),
                )
            })?;
        let cutoff_resolution = args
            .cutoff_resolution
            .or(selection.cutoff_resolution)
            .ok_or_else(|| {
                CliError::Config(
                    "`selection.cutoff-resolution` is required (or pass `--cutoff-resolution`)."
                        .to_string(),
                )
            })?;

        let balance = Self::merge_balance(
            args.balance.or(selection.balance),
            args.seed.or(selection.seed),
        );

        let num_workers = args.num_workers.or(execution.num_workers).unwrap_or(1);
        if num_workers == 0 {
            return Err(CliError::Argument(
                "The number of workers must be at least 1.".to_string(),
            ));
        }

        let mut builder = SieveConfigBuilder::new()
            .particles_path(args.input.clone())
            .pixel_size(args.angpix.or(input.angpix))
            .volumes(volumes)
            .mask(args.mask.clone().or(input.mask))
            .retention_ratio(retention_ratio)
            .cutoff_resolution(cutoff_resolution)
            .balance(balance)
            .retained_path(args.output.clone())
            .scores_path(args.scores.clone().or(output.scores));
        if let Some(directory) = args.directory.clone().or(input.directory) {
            builder = builder.data_dir(directory);
        }
        if let Some(batch_size) = args.batch_size.or(execution.batch_size) {
            builder = builder.batch_size(batch_size);
        }
        if let Some(loader_threads) = args.loader_threads.or(execution.loader_threads) {
            builder = builder.loader_threads(loader_threads);
        }

        let sieve = builder
            .build()
            .map_err(|e| CliError::Config(e.to_string()))?;
        Ok(RunConfig { sieve, num_workers })
    }

    fn merge_balance(mode: Option<BalanceMode>, seed: Option<u64>) -> BalanceStrategy {
        match mode.unwrap_or(BalanceMode::None) {
            BalanceMode::None => BalanceStrategy::None,
            BalanceMode::Clamp => BalanceStrategy::Clamp,
            BalanceMode::Resample => {
                let seed = seed.unwrap_or_else(|| {
                    info!("No seed given for resampling; using {}.", DEFAULT_SEED);
                    DEFAULT_SEED
                });
                BalanceStrategy::Resample { seed }
            }
        }
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value_str)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };
            let key = key.trim();

            match key {
                "input.angpix" => {
                    self.input.get_or_insert_with(Default::default).angpix =
                        Some(parse_value(key, value_str, "float")?);
                }
                "input.directory" => {
                    self.input.get_or_insert_with(Default::default).directory =
                        Some(PathBuf::from(value_str.trim()));
                }
                "selection.retention-ratio" => {
                    self.selection
                        .get_or_insert_with(Default::default)
                        .retention_ratio = Some(parse_value(key, value_str, "float")?);
                }
                "selection.cutoff-resolution" => {
                    self.selection
                        .get_or_insert_with(Default::default)
                        .cutoff_resolution = Some(parse_value(key, value_str, "float")?);
                }
                "selection.seed" => {
                    self.selection.get_or_insert_with(Default::default).seed =
                        Some(parse_value(key, value_str, "integer")?);
                }
                "execution.num-workers" => {
                    self.execution
                        .get_or_insert_with(Default::default)
                        .num_workers = Some(parse_value(key, value_str, "integer")?);
                }
                "execution.batch-size" => {
                    self.execution
                        .get_or_insert_with(Default::default)
                        .batch_size = Some(parse_value(key, value_str, "integer")?);
                }
                "execution.loader-threads" => {
                    self.execution
                        .get_or_insert_with(Default::default)
                        .loader_threads = Some(parse_value(key, value_str, "integer")?);
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}
