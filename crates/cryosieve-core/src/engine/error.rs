use thiserror::Error;

use super::config::ConfigError;
use super::device::DeviceError;
use crate::core::io::mrc::MrcError;
use crate::core::io::star::StarError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] StarError),

    #[error("Map error: {0}")]
    Map(#[from] MrcError),

    #[error("Found {half_sets} half-sets but {volumes} reference volumes; one volume per half-set is required")]
    Cardinality { half_sets: usize, volumes: usize },

    #[error("Reference volume '{path}' has shape {shape:?}; expected a cube of side {expected}")]
    VolumeShape {
        path: String,
        shape: [usize; 3],
        expected: usize,
    },

    #[error("Image {slice} of '{path}' is {found:?}; expected {expected}x{expected} to match the reference volume")]
    ImageShape {
        path: String,
        slice: usize,
        found: (usize, usize),
        expected: usize,
    },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Failed to write scores: {0}")]
    Scores(#[from] csv::Error),

    #[error("Internal logic error: {0}")]
    Internal(String),
}
