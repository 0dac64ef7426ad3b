use super::fourier::{filter_stack, for_each_bin};
use nalgebra::Vector2;
use ndarray::{Array3, Axis};
use rustfft::num_complex::Complex64;
use std::f64::consts::PI;

/// Shifts every image by its sub-pixel offset using a Fourier phase ramp.
///
/// A positive `x` offset moves content towards larger column indices. The
/// image is treated as periodic.
///
/// # Panics
///
/// Panics if `shifts` does not hold one entry per image.
pub fn translate(stack: &mut Array3<f64>, shifts: &[Vector2<f64>]) {
    assert_eq!(stack.len_of(Axis(0)), shifts.len(), "one shift per image is required");
    let n = stack.dim().1 as f64;
    filter_stack(stack, |index, spectrum| {
        let shift = shifts[index];
        for_each_bin(spectrum, |kx, ky, bin| {
            let phase = -2.0 * PI * (shift.x * kx / n + shift.y * ky / n);
            *bin *= Complex64::from_polar(1.0, phase);
        });
    });
}
