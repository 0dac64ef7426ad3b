use std::path::PathBuf;
use thiserror::Error;

/// Images scored per kernel invocation unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Host threads reading particle images ahead of the scoring loop.
pub const DEFAULT_LOADER_THREADS: usize = 4;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidValue {
        parameter: &'static str,
        reason: String,
    },
}

/// How half-sets of unequal size are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceStrategy {
    /// Every half-set keeps its own retained count.
    #[default]
    None,
    /// Retained counts are clamped to the smallest count of any half-set.
    Clamp,
    /// Half-sets are randomly down-sampled to equal size before scoring.
    Resample { seed: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputConfig {
    pub particles_path: PathBuf,
    /// Directory that image stack paths are resolved against.
    pub data_dir: PathBuf,
    /// Pixel size in Angstroms, required when the metadata carries none.
    pub pixel_size: Option<f64>,
    /// One reference volume per half-set, in ascending half-set order.
    pub volumes: Vec<PathBuf>,
    pub mask: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConfig {
    /// Fraction of each half-set that is retained, in `(0, 1]`.
    pub retention_ratio: f64,
    /// High-pass cutoff resolution in Angstroms.
    pub cutoff_resolution: f64,
    pub balance: BalanceStrategy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub retained_path: PathBuf,
    pub scores_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub batch_size: usize,
    pub loader_threads: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            loader_threads: DEFAULT_LOADER_THREADS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SieveConfig {
    pub input: InputConfig,
    pub selection: SelectionConfig,
    pub output: OutputConfig,
    pub execution: ExecutionConfig,
}

#[derive(Default)]
pub struct SieveConfigBuilder {
    particles_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    pixel_size: Option<f64>,
    volumes: Vec<PathBuf>,
    mask: Option<PathBuf>,
    retention_ratio: Option<f64>,
    cutoff_resolution: Option<f64>,
    balance: BalanceStrategy,
    retained_path: Option<PathBuf>,
    scores_path: Option<PathBuf>,
    batch_size: Option<usize>,
    loader_threads: Option<usize>,
}

impl SieveConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn particles_path(mut self, path: PathBuf) -> Self {
        self.particles_path = Some(path);
        self
    }
    pub fn data_dir(mut self, path: PathBuf) -> Self {
        self.data_dir = Some(path);
        self
    }
    pub fn pixel_size(mut self, pixel_size: Option<f64>) -> Self {
        self.pixel_size = pixel_size;
        self
    }
    pub fn volume(mut self, path: PathBuf) -> Self {
        self.volumes.push(path);
        self
    }
    pub fn volumes(mut self, paths: Vec<PathBuf>) -> Self {
        self.volumes = paths;
        self
    }
    pub fn mask(mut self, path: Option<PathBuf>) -> Self {
        self.mask = path;
        self
    }
    pub fn retention_ratio(mut self, ratio: f64) -> Self {
        self.retention_ratio = Some(ratio);
        self
    }
    pub fn cutoff_resolution(mut self, angstroms: f64) -> Self {
        self.cutoff_resolution = Some(angstroms);
        self
    }
    pub fn balance(mut self, strategy: BalanceStrategy) -> Self {
        self.balance = strategy;
        self
    }
    pub fn retained_path(mut self, path: PathBuf) -> Self {
        self.retained_path = Some(path);
        self
    }
    pub fn scores_path(mut self, path: Option<PathBuf>) -> Self {
        self.scores_path = path;
        self
    }
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
    pub fn loader_threads(mut self, threads: usize) -> Self {
        self.loader_threads = Some(threads);
        self
    }

    pub fn build(self) -> Result<SieveConfig, ConfigError> {
        if self.volumes.is_empty() {
            return Err(ConfigError::MissingParameter("volumes"));
        }
        let retention_ratio = self
            .retention_ratio
            .ok_or(ConfigError::MissingParameter("retention_ratio"))?;
        if !(retention_ratio > 0.0 && retention_ratio <= 1.0) {
            return Err(ConfigError::InvalidValue {
                parameter: "retention_ratio",
                reason: format!("{retention_ratio} is outside (0, 1]"),
            });
        }
        let cutoff_resolution = self
            .cutoff_resolution
            .ok_or(ConfigError::MissingParameter("cutoff_resolution"))?;
        positive("cutoff_resolution", cutoff_resolution)?;
        if let Some(pixel_size) = self.pixel_size {
            positive("pixel_size", pixel_size)?;
        }
        let batch_size = self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                parameter: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(SieveConfig {
            input: InputConfig {
                particles_path: self
                    .particles_path
                    .ok_or(ConfigError::MissingParameter("particles_path"))?,
                data_dir: self.data_dir.unwrap_or_default(),
                pixel_size: self.pixel_size,
                volumes: self.volumes,
                mask: self.mask,
            },
            selection: SelectionConfig {
                retention_ratio,
                cutoff_resolution,
                balance: self.balance,
            },
            output: OutputConfig {
                retained_path: self
                    .retained_path
                    .ok_or(ConfigError::MissingParameter("retained_path"))?,
                scores_path: self.scores_path,
            },
            execution: ExecutionConfig {
                batch_size,
                loader_threads: self.loader_threads.unwrap_or(DEFAULT_LOADER_THREADS).max(1),
            },
        })
    }
}

fn positive(parameter: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            parameter,
            reason: format!("{value} is not a positive number"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> SieveConfigBuilder {
        SieveConfigBuilder::new()
            .particles_path(PathBuf::from("in.star"))
            .volume(PathBuf::from("half1.mrc"))
            .volume(PathBuf::from("half2.mrc"))
            .retention_ratio(0.8)
            .cutoff_resolution(40.0)
            .retained_path(PathBuf::from("out.star"))
    }

    #[test]
    fn build_applies_defaults() {
        let config = complete().build().unwrap();
        assert_eq!(config.execution, ExecutionConfig::default());
        assert_eq!(config.selection.balance, BalanceStrategy::None);
        assert_eq!(config.input.data_dir, PathBuf::new());
        assert_eq!(config.input.volumes.len(), 2);
    }

    #[test]
    fn build_fails_on_missing_parameters() {
        let err = SieveConfigBuilder::new().build().unwrap_err();
        assert_eq!(err, ConfigError::MissingParameter("volumes"));

        let err = SieveConfigBuilder::new()
            .volume(PathBuf::from("v.mrc"))
            .retention_ratio(0.5)
            .cutoff_resolution(10.0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingParameter("particles_path"));
    }

    #[test]
    fn retention_ratio_must_lie_in_unit_interval() {
        for ratio in [0.0, -0.1, 1.01, f64::NAN] {
            let err = complete().retention_ratio(ratio).build().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue {
                    parameter: "retention_ratio",
                    ..
                }
            ));
        }
        assert!(complete().retention_ratio(1.0).build().is_ok());
    }

    #[test]
    fn non_positive_sizes_are_rejected() {
        assert!(complete().cutoff_resolution(0.0).build().is_err());
        assert!(complete().pixel_size(Some(-1.0)).build().is_err());
        assert!(complete().batch_size(0).build().is_err());
    }
}
