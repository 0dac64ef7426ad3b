//! Provides input/output functionality for particle metadata and density maps.
//!
//! Particle metadata is read from and written to STAR files through the
//! [`traits::ParticleFile`] interface. Reference volumes, masks and particle
//! image stacks are read from MRC files into dense `f64` arrays.

pub mod mrc;
pub mod star;
pub mod traits;
