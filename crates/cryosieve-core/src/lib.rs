//! # CryoSieve Core Library
//!
//! Particle sieving for cryo-EM single-particle analysis. Each particle image
//! is compared with a CTF-modulated projection of the reference map of its
//! half-set, and only the best-agreeing fraction of each half-set is kept.
//!
//! ## Architectural Philosophy
//!
//! The library follows a three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Stateless particle models, STAR and MRC
//!   readers and writers, and the image kernels (`project`, `convolute_ctf`,
//!   `translate`, `highpass2d`).
//!
//! - **[`engine`]: The Logic Core.** Configuration, compute devices, the
//!   distributed collective used to sum per-worker scores, batch prefetching,
//!   scoring and selection.
//!
//! - **[`workflows`]: The Public API.** Ties the `engine` and `core` together
//!   into a complete sieving pass with progress reporting.

pub mod core;
pub mod engine;
pub mod workflows;
