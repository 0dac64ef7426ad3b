use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// The non-redundant half of the 2D spectrum of a real `n x n` image.
pub type HalfSpectrum = Array2<Complex64>;

/// Signed frequency index of bin `k` along a full axis of length `n`.
pub fn signed_frequency(k: usize, n: usize) -> f64 {
    if k < n.div_ceil(2) {
        k as f64
    } else {
        k as f64 - n as f64
    }
}

/// Forward and inverse transforms for square images of one side length.
#[derive(Clone)]
pub struct FourierPlan {
    n: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl FourierPlan {
    pub fn new(n: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            n,
            forward: planner.plan_fft_forward(n),
            inverse: planner.plan_fft_inverse(n),
        }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    /// Number of bins along the half axis.
    pub fn half_width(&self) -> usize {
        self.n / 2 + 1
    }

    /// Real-to-complex 2D transform, unnormalised.
    pub fn rfft2(&self, image: ArrayView2<f64>) -> HalfSpectrum {
        let (n, half) = (self.n, self.half_width());
        let mut spectrum = HalfSpectrum::zeros((n, half));
        let mut buffer = vec![Complex64::default(); n];

        for (line, mut out) in image.outer_iter().zip(spectrum.outer_iter_mut()) {
            for (slot, &value) in buffer.iter_mut().zip(line.iter()) {
                *slot = Complex64::new(value, 0.0);
            }
            self.forward.process(&mut buffer);
            for (dst, src) in out.iter_mut().zip(&buffer[..half]) {
                *dst = *src;
            }
        }
        self.transform_columns(&mut spectrum, &*self.forward, &mut buffer);
        spectrum
    }

    /// Complex-to-real 2D transform, normalised by `1 / n^2`.
    ///
    /// The imaginary parts of bins that are their own mirror image are
    /// discarded, so any half spectrum maps to a real image.
    pub fn irfft2(&self, spectrum: &HalfSpectrum) -> Array2<f64> {
        let (n, half) = (self.n, self.half_width());
        let mut work = spectrum.clone();
        let mut buffer = vec![Complex64::default(); n];
        self.transform_columns(&mut work, &*self.inverse, &mut buffer);

        let scale = 1.0 / (n * n) as f64;
        let mut image = Array2::zeros((n, n));
        for (row, mut out) in work.outer_iter().zip(image.outer_iter_mut()) {
            for (k, slot) in buffer.iter_mut().enumerate() {
                *slot = if k < half { row[k] } else { row[n - k].conj() };
            }
            self.inverse.process(&mut buffer);
            for (dst, src) in out.iter_mut().zip(&buffer) {
                *dst = src.re * scale;
            }
        }
        image
    }

    fn transform_columns(&self, spectrum: &mut HalfSpectrum, fft: &dyn Fft<f64>, buffer: &mut [Complex64]) {
        for mut column in spectrum.columns_mut() {
            for (slot, value) in buffer.iter_mut().zip(column.iter()) {
                *slot = *value;
            }
            fft.process(buffer);
            for (dst, src) in column.iter_mut().zip(buffer.iter()) {
                *dst = *src;
            }
        }
    }
}

/// Applies `filter` to the half spectrum of every image of a stack in place.
///
/// The filter receives the image index within the stack and the spectrum.
///
/// # Panics
///
/// Panics if the images of the stack are not square.
pub fn filter_stack<F>(stack: &mut Array3<f64>, filter: F)
where
    F: Fn(usize, &mut HalfSpectrum) + Sync,
{
    let (_, rows, cols) = stack.dim();
    assert_eq!(rows, cols, "stack images must be square");
    let plan = FourierPlan::new(rows);

    stack
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(index, mut image)| {
            let mut spectrum = plan.rfft2(image.view());
            filter(index, &mut spectrum);
            image.assign(&plan.irfft2(&spectrum));
        });
}

/// Visits every bin of a half spectrum with its signed `(kx, ky)` frequency.
pub fn for_each_bin<F>(spectrum: &mut HalfSpectrum, mut visit: F)
where
    F: FnMut(f64, f64, &mut Complex64),
{
    let n = spectrum.nrows();
    for ((row, col), bin) in spectrum.indexed_iter_mut() {
        visit(col as f64, signed_frequency(row, n), bin);
    }
}
