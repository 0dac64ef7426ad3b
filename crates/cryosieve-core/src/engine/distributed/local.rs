use super::{Collective, accumulate};
use crate::engine::device::DeviceError;
use crossbeam_channel::{Receiver, Sender, unbounded};

enum Endpoint {
    Controller { peers: Vec<Receiver<Vec<f64>>> },
    Worker { to_controller: Sender<Vec<f64>> },
}

/// An in-process group whose workers run on threads of the same process.
///
/// Every non-controller owns a channel to the controller, which receives the
/// contributions of one reduction in rank order.
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    endpoint: Endpoint,
}

impl LocalGroup {
    /// Creates the connected endpoints of a group, indexed by rank.
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) = (1..world_size).map(|_| unbounded()).unzip();

        let controller = LocalGroup {
            rank: 0,
            world_size,
            endpoint: Endpoint::Controller { peers: receivers },
        };
        std::iter::once(controller)
            .chain(senders.into_iter().enumerate().map(|(i, to_controller)| LocalGroup {
                rank: i + 1,
                world_size,
                endpoint: Endpoint::Worker { to_controller },
            }))
            .collect()
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn reduce_sum(&mut self, partial: Vec<f64>) -> Result<Option<Vec<f64>>, DeviceError> {
        match &self.endpoint {
            Endpoint::Controller { peers } => {
                let mut total = partial;
                for (i, peer) in peers.iter().enumerate() {
                    let rank = i + 1;
                    let contribution = peer
                        .recv()
                        .map_err(|_| DeviceError::Disconnected { rank })?;
                    accumulate(&mut total, &contribution, rank)?;
                }
                Ok(Some(total))
            }
            Endpoint::Worker { to_controller } => {
                to_controller
                    .send(partial)
                    .map_err(|_| DeviceError::Disconnected { rank: 0 })?;
                Ok(None)
            }
        }
    }
}
