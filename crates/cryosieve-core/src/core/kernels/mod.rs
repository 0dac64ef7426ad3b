//! Data-parallel forward-model kernels.
//!
//! Every kernel works on stacks of square images stored as `(m, n, n)` arrays
//! in double precision and preserves their shape. Images of a stack are
//! processed independently on the current rayon pool, so callers pick the
//! executing device by installing its pool around the call.
//!
//! Fourier-space kernels transform each image to its half spectrum of shape
//! `n x (n / 2 + 1)`, rewrite the bins in place and transform back. The full
//! axis (rows) carries the signed `y` frequency, the half axis (columns) the
//! non-negative `x` frequency.

pub mod ctf;
pub mod fourier;
pub mod highpass;
pub mod project;
pub mod translate;

pub use ctf::convolute_ctf;
pub use highpass::{highpass2d, highpass2d_per_image};
pub use project::project;
pub use translate::translate;
