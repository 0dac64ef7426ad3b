//! # Core Models Module
//!
//! This module contains the particle metadata model shared by the I/O layer and
//! the scoring engine.
//!
//! ## Overview
//!
//! - [`particle`] - The fixed-width per-particle record, CTF parameters and image locators
//! - [`table`] - The immutable, schema-tagged table produced by the metadata parser
//! - [`set`] - Ordered views over a shared table used for subsetting, splitting and balancing
//!
//! ## Usage
//!
//! ```ignore
//! use cryosieve::core::io::star::StarFile;
//! use cryosieve::core::models::set::ParticleSet;
//!
//! let table = StarFile::load(Path::new("particles.star"), Path::new("."), Some(1.06))?;
//! let particles = ParticleSet::new(table);
//! for id in particles.half_set_ids() {
//!     println!("half-set {id}: {} particles", particles.half_set(id).len());
//! }
//! ```

pub mod particle;
pub mod set;
pub mod table;
