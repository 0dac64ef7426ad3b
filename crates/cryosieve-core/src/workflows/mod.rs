//! # Workflows Module
//!
//! High-level entry points that run a complete sieving pass from a particle
//! metadata file to the retained and sieved-out output files.
//!
//! ## Overview
//!
//! A workflow loads the particle table and reference volumes, scores every
//! half-set against its reference, selects the best-agreeing particles and
//! writes the results. It reports progress through the engine's
//! [`ProgressReporter`](crate::engine::progress::ProgressReporter) and is the
//! layer the command-line front end drives.
//!
//! - **Sieve Workflow** ([`sieve`]) - One worker of a group via [`sieve::run`],
//!   or a whole in-process group via [`sieve::run_local_group`].

pub mod sieve;
