use super::context::parse_var;
use super::{Collective, accumulate};
use crate::engine::device::DeviceError;
use std::env;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a worker keeps retrying to reach the controller.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const ACK: u8 = 0x06;

struct Peer {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Peer {
    fn new(stream: TcpStream) -> Result<Self, DeviceError> {
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    fn send_u32(&mut self, value: u32) -> Result<(), DeviceError> {
        self.writer.write_all(&value.to_le_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn recv_u32(&mut self) -> Result<u32, DeviceError> {
        let mut bytes = [0u8; 4];
        self.reader.read_exact(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn send_ack(&mut self) -> Result<(), DeviceError> {
        self.writer.write_all(&[ACK])?;
        self.writer.flush()?;
        Ok(())
    }

    fn recv_ack(&mut self) -> Result<(), DeviceError> {
        let mut byte = [0u8; 1];
        self.reader.read_exact(&mut byte)?;
        if byte[0] != ACK {
            return Err(DeviceError::Rendezvous(format!(
                "unexpected acknowledgement byte {:#04x}",
                byte[0]
            )));
        }
        Ok(())
    }

    fn send_vector(&mut self, values: &[f64]) -> Result<(), DeviceError> {
        self.writer.write_all(&(values.len() as u64).to_le_bytes())?;
        for value in values {
            self.writer.write_all(&value.to_le_bytes())?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Reads a vector from `rank`, rejecting any announced length other than `expected`.
    fn recv_vector(&mut self, expected: usize, rank: usize) -> Result<Vec<f64>, DeviceError> {
        let mut word = [0u8; 8];
        self.reader.read_exact(&mut word)?;
        let found = usize::try_from(u64::from_le_bytes(word)).unwrap_or(usize::MAX);
        if found != expected {
            return Err(DeviceError::LengthMismatch {
                rank,
                expected,
                found,
            });
        }
        let mut values = Vec::with_capacity(expected);
        for _ in 0..expected {
            self.reader.read_exact(&mut word)?;
            values.push(f64::from_le_bytes(word));
        }
        Ok(values)
    }
}

fn rendezvous_endpoint(addr: Option<String>, port: Option<String>) -> Result<String, DeviceError> {
    let addr = addr.ok_or(DeviceError::MissingVariable("MASTER_ADDR"))?;
    let port = port.ok_or(DeviceError::MissingVariable("MASTER_PORT"))?;
    let number = parse_var("MASTER_PORT", &port)?;
    if u16::try_from(number).is_err() {
        return Err(DeviceError::InvalidVariable {
            name: "MASTER_PORT",
            value: port,
        });
    }
    Ok(format!("{addr}:{number}"))
}

enum Role {
    Controller { peers: Vec<Peer> },
    Worker { controller: Peer },
}

/// A multi-process group connected over TCP.
///
/// Rank 0 listens at the rendezvous address; every other rank connects and
/// announces its rank. Construction returns on every member only after the
/// whole group has joined, and each reduction completes on all members
/// before any of them proceeds.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl TcpGroup {
    /// Joins the group described by `MASTER_ADDR` and `MASTER_PORT`.
    pub fn from_env(rank: usize, world_size: usize) -> Result<Self, DeviceError> {
        let endpoint =
            rendezvous_endpoint(env::var("MASTER_ADDR").ok(), env::var("MASTER_PORT").ok())?;
        if rank == 0 {
            Self::host(TcpListener::bind(&endpoint)?, world_size)
        } else {
            Self::join(&endpoint, rank, world_size, CONNECT_TIMEOUT)
        }
    }

    /// Accepts the other `world_size - 1` members on `listener` as rank 0.
    pub fn host(listener: TcpListener, world_size: usize) -> Result<Self, DeviceError> {
        info!(
            addr = ?listener.local_addr().ok(),
            world_size,
            "Waiting for workers to join."
        );
        let mut slots: Vec<Option<Peer>> = (1..world_size).map(|_| None).collect();
        while slots.iter().any(Option::is_none) {
            let (stream, remote) = listener.accept()?;
            let mut peer = Peer::new(stream)?;
            let rank = peer.recv_u32()? as usize;
            let slot = rank
                .checked_sub(1)
                .and_then(|i| slots.get_mut(i))
                .ok_or(DeviceError::InvalidRank { rank, world_size })?;
            if slot.is_some() {
                return Err(DeviceError::Rendezvous(format!(
                    "rank {rank} joined twice"
                )));
            }
            debug!(rank, %remote, "Worker joined.");
            *slot = Some(peer);
        }

        let mut peers: Vec<Peer> = slots.into_iter().flatten().collect();
        for peer in &mut peers {
            peer.send_ack()?;
        }
        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Controller { peers },
        })
    }

    /// Connects to the controller at `endpoint` as `rank`, retrying until `timeout`.
    pub fn join(
        endpoint: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        if rank == 0 || rank >= world_size {
            return Err(DeviceError::InvalidRank { rank, world_size });
        }
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(endpoint) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(rank, error = %e, "Controller not reachable yet; retrying.");
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        };
        let mut controller = Peer::new(stream)?;
        controller.send_u32(rank as u32)?;
        controller.recv_ack()?;
        Ok(Self {
            rank,
            world_size,
            role: Role::Worker { controller },
        })
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn reduce_sum(&mut self, partial: Vec<f64>) -> Result<Option<Vec<f64>>, DeviceError> {
        match &mut self.role {
            Role::Controller { peers } => {
                let mut total = partial;
                for (i, peer) in peers.iter_mut().enumerate() {
                    let rank = i + 1;
                    let contribution = peer.recv_vector(total.len(), rank).map_err(|e| match e {
                        DeviceError::Io(_) => DeviceError::Disconnected { rank },
                        other => other,
                    })?;
                    accumulate(&mut total, &contribution, rank)?;
                }
                for peer in peers.iter_mut() {
                    peer.send_ack()?;
                }
                Ok(Some(total))
            }
            Role::Worker { controller } => {
                controller.send_vector(&partial)?;
                controller
                    .recv_ack()
                    .map_err(|_| DeviceError::Disconnected { rank: 0 })?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_reduces_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let world_size = 3;

        let total = thread::scope(|s| {
            for rank in 1..world_size {
                let endpoint = endpoint.clone();
                s.spawn(move || {
                    let mut group =
                        TcpGroup::join(&endpoint, rank, world_size, Duration::from_secs(10)).unwrap();
                    let mut partial = vec![0.0; 4];
                    partial[rank] = rank as f64;
                    assert_eq!(group.reduce_sum(partial).unwrap(), None);
                });
            }
            let mut group = TcpGroup::host(listener, world_size).unwrap();
            let mut partial = vec![0.0; 4];
            partial[3] = 0.5;
            group.reduce_sum(partial).unwrap()
        });

        assert_eq!(total, Some(vec![0.0, 1.0, 2.0, 0.5]));
    }

    #[test]
    fn oversized_length_prefix_is_a_length_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap();

        let result = thread::scope(|s| {
            s.spawn(move || {
                let mut stream = TcpStream::connect(endpoint).unwrap();
                stream.write_all(&1u32.to_le_bytes()).unwrap();
                let mut ack = [0u8; 1];
                stream.read_exact(&mut ack).unwrap();
                stream.write_all(&u64::MAX.to_le_bytes()).unwrap();
                stream.flush().unwrap();
            });
            let mut group = TcpGroup::host(listener, 2).unwrap();
            group.reduce_sum(vec![0.0; 4])
        });

        assert!(matches!(
            result,
            Err(DeviceError::LengthMismatch {
                rank: 1,
                expected: 4,
                found: usize::MAX,
            })
        ));
    }

    #[test]
    fn worker_that_leaves_is_reported_as_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap();

        let result = thread::scope(|s| {
            s.spawn(move || {
                let mut stream = TcpStream::connect(endpoint).unwrap();
                stream.write_all(&1u32.to_le_bytes()).unwrap();
                let mut ack = [0u8; 1];
                stream.read_exact(&mut ack).unwrap();
            });
            let mut group = TcpGroup::host(listener, 2).unwrap();
            group.reduce_sum(vec![0.0; 4])
        });

        assert!(matches!(
            result,
            Err(DeviceError::Disconnected { rank: 1 })
        ));
    }

    #[test]
    fn rendezvous_requires_address_and_port() {
        assert_eq!(
            rendezvous_endpoint(Some("10.0.0.2".into()), Some("29500".into())).unwrap(),
            "10.0.0.2:29500"
        );
        assert!(matches!(
            rendezvous_endpoint(None, Some("29500".into())),
            Err(DeviceError::MissingVariable("MASTER_ADDR"))
        ));
        assert!(matches!(
            rendezvous_endpoint(Some("localhost".into()), None),
            Err(DeviceError::MissingVariable("MASTER_PORT"))
        ));
        assert!(matches!(
            rendezvous_endpoint(Some("localhost".into()), Some("70000".into())),
            Err(DeviceError::InvalidVariable { .. })
        ));
    }

    #[test]
    fn join_rejects_controller_rank() {
        assert!(matches!(
            TcpGroup::join("127.0.0.1:1", 0, 2, Duration::ZERO),
            Err(DeviceError::InvalidRank { .. })
        ));
    }
}
