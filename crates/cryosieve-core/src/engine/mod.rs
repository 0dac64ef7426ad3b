//! # Engine Module
//!
//! This module implements the particle scoring engine: per-particle
//! disagreement scores, their distribution across workers and the selection
//! of the particles to keep.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Run parameters and their validation
//! - **Devices** ([`device`]) - Dedicated worker pools that execute the kernels
//! - **Distribution** ([`distributed`]) - Worker identity, block partitioning and score reduction
//! - **Prefetching** ([`prefetch`]) - Host-side image loading that overlaps with scoring
//! - **Scoring** ([`scoring`]) - The forward model and the per-particle score
//! - **Selection** ([`selection`]) - Ranking of scores and retained counts
//! - **Progress Monitoring** ([`progress`]) - Progress reporting for front ends
//! - **Error Handling** ([`error`]) - Engine-specific error types

pub mod config;
pub mod device;
pub mod distributed;
pub mod error;
pub mod prefetch;
pub mod progress;
pub mod scoring;
pub mod selection;
