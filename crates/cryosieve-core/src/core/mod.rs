//! # Core Module
//!
//! Stateless building blocks of the sieving engine.
//!
//! - **Particle Representation** ([`models`]) - Particle records, the immutable
//!   particle table and lightweight views over it
//! - **File I/O** ([`io`]) - STAR metadata and MRC image/volume formats
//! - **Image Kernels** ([`kernels`]) - Projection, CTF modulation, sub-pixel
//!   translation and high-pass filtering of image stacks
//!
//! Every kernel operates on a whole stack at once and is parallelised over
//! images with rayon, so callers control concurrency by choosing the pool the
//! kernel runs in.

pub mod io;
pub mod kernels;
pub mod models;
