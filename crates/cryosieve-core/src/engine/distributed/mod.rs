//! Work partitioning and score reduction across workers.
//!
//! A run is executed by a group of workers identified by their rank. Each
//! worker scores one contiguous block of every half-set into a zero-filled
//! vector covering the whole half-set; a [`Collective`] backend then sums the
//! vectors onto rank 0, the controller.

mod context;
mod local;
mod tcp;

pub use context::{DistributedContext, LaunchMode};
pub use local::LocalGroup;
pub use tcp::TcpGroup;

use super::device::DeviceError;

/// Sum-reduction of score vectors onto the controller.
pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Sums `partial` element-wise across the group.
    ///
    /// Every worker must call this the same number of times with vectors of
    /// equal length. The controller receives the total; all other ranks get
    /// `None` once their contribution has been handed over.
    fn reduce_sum(&mut self, partial: Vec<f64>) -> Result<Option<Vec<f64>>, DeviceError>;
}

/// The trivial group of one worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct Standalone;

impl Collective for Standalone {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn reduce_sum(&mut self, partial: Vec<f64>) -> Result<Option<Vec<f64>>, DeviceError> {
        Ok(Some(partial))
    }
}

/// Adds `partial` into `total`, checking that the contributing worker sent a full vector.
fn accumulate(total: &mut [f64], partial: &[f64], rank: usize) -> Result<(), DeviceError> {
    if partial.len() != total.len() {
        return Err(DeviceError::LengthMismatch {
            rank,
            expected: total.len(),
            found: partial.len(),
        });
    }
    for (t, p) in total.iter_mut().zip(partial) {
        *t += p;
    }
    Ok(())
}

/// Builds the context and collective for the current process from its environment.
///
/// Without `RANK` and `WORLD_SIZE` the process runs standalone. Otherwise it
/// joins a TCP group at `MASTER_ADDR:MASTER_PORT`.
pub fn connect_from_env(
    threads: usize,
) -> Result<(DistributedContext, Box<dyn Collective>), DeviceError> {
    match LaunchMode::from_env()? {
        LaunchMode::Standalone => {
            let context = DistributedContext::standalone(threads)?;
            Ok((context, Box::new(Standalone)))
        }
        LaunchMode::Distributed { rank, world_size } => {
            let context = DistributedContext::new(rank, world_size, threads)?;
            let group = TcpGroup::from_env(rank, world_size)?;
            Ok((context, Box::new(group)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_returns_its_own_vector() {
        let mut group = Standalone;
        assert_eq!(group.reduce_sum(vec![1.0, 2.0]).unwrap(), Some(vec![1.0, 2.0]));
        assert_eq!((group.rank(), group.world_size()), (0, 1));
    }

    #[test]
    fn accumulate_rejects_short_vectors() {
        let mut total = vec![0.0; 3];
        accumulate(&mut total, &[1.0, 2.0, 3.0], 1).unwrap();
        assert_eq!(total, vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            accumulate(&mut total, &[1.0], 2),
            Err(DeviceError::LengthMismatch {
                rank: 2,
                expected: 3,
                found: 1
            })
        ));
    }
}
