use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to start worker pool for device {index}: {source}")]
    Pool {
        index: usize,
        #[source]
        source: ThreadPoolBuildError,
    },
    #[error("Environment variable {0} is required in distributed mode")]
    MissingVariable(&'static str),
    #[error("Environment variable {name} has invalid value '{value}'")]
    InvalidVariable { name: &'static str, value: String },
    #[error("Rank {rank} is outside a group of {world_size} workers")]
    InvalidRank { rank: usize, world_size: usize },
    #[error("Communication failed: {0}")]
    Io(#[from] io::Error),
    #[error("Group rendezvous failed: {0}")]
    Rendezvous(String),
    #[error("Worker {rank} left the group before the reduction completed")]
    Disconnected { rank: usize },
    #[error("Worker {rank} sent {found} values, expected {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        found: usize,
    },
    #[error("Worker {rank} panicked")]
    WorkerPanicked { rank: usize },
}

/// A compute device: a dedicated data-parallel pool that runs the kernels of one worker.
#[derive(Clone)]
pub struct Device {
    index: usize,
    pool: Arc<ThreadPool>,
}

impl Device {
    /// Starts a device pool. `threads == 0` lets rayon pick the thread count.
    pub fn new(index: usize, threads: usize) -> Result<Self, DeviceError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("cryosieve-dev{index}-{i}"))
            .build()
            .map_err(|source| DeviceError::Pool { index, source })?;
        debug!(index, threads = pool.current_num_threads(), "Device pool started.");
        Ok(Self {
            index,
            pool: Arc::new(pool),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` with this device's pool as the current rayon pool.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("threads", &self.threads())
            .finish()
    }
}

/// Splits the host's cores evenly across `devices` pools.
pub fn threads_per_device(total: usize, devices: usize) -> usize {
    let total = if total == 0 {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        total
    };
    (total / devices.max(1)).max(1)
}
