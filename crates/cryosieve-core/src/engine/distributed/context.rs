use crate::engine::device::{Device, DeviceError};
use std::env;
use std::ops::Range;

/// How the current process takes part in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Standalone,
    Distributed { rank: usize, world_size: usize },
}

impl LaunchMode {
    /// Reads `RANK` and `WORLD_SIZE`; both must be set to run distributed.
    pub fn from_env() -> Result<Self, DeviceError> {
        Self::from_vars(env::var("RANK").ok(), env::var("WORLD_SIZE").ok())
    }

    fn from_vars(rank: Option<String>, world_size: Option<String>) -> Result<Self, DeviceError> {
        let (Some(rank), Some(world_size)) = (rank, world_size) else {
            return Ok(LaunchMode::Standalone);
        };
        let rank = parse_var("RANK", &rank)?;
        let world_size = parse_var("WORLD_SIZE", &world_size)?;
        if world_size == 0 || rank >= world_size {
            return Err(DeviceError::InvalidRank { rank, world_size });
        }
        Ok(LaunchMode::Distributed { rank, world_size })
    }
}

pub(super) fn parse_var(name: &'static str, value: &str) -> Result<usize, DeviceError> {
    value
        .trim()
        .parse()
        .map_err(|_| DeviceError::InvalidVariable {
            name,
            value: value.to_string(),
        })
}

/// Identity of one worker within its group, together with its device.
#[derive(Debug, Clone)]
pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    device: Device,
}

impl DistributedContext {
    /// Creates the context of worker `rank`, bound to the device of the same index.
    pub fn new(rank: usize, world_size: usize, threads: usize) -> Result<Self, DeviceError> {
        if rank >= world_size {
            return Err(DeviceError::InvalidRank { rank, world_size });
        }
        Ok(Self {
            rank,
            world_size,
            device: Device::new(rank, threads)?,
        })
    }

    pub fn standalone(threads: usize) -> Result<Self, DeviceError> {
        Self::new(0, 1, threads)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether this worker collects the reduced scores and writes outputs.
    pub fn is_controller(&self) -> bool {
        self.rank == 0
    }

    /// Contiguous block of an `m`-element sequence assigned to this worker.
    ///
    /// Blocks of all ranks tile `0..m` without gaps or overlap.
    pub fn block(&self, m: usize) -> Range<usize> {
        let edge = |r: usize| (r as f64 / self.world_size as f64 * m as f64).round_ties_even() as usize;
        edge(self.rank)..edge(self.rank + 1)
    }
}
