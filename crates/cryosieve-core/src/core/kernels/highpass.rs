use super::fourier::{filter_stack, for_each_bin};
use ndarray::{Array3, Axis};
use rustfft::num_complex::Complex64;
use std::f64::consts::FRAC_1_SQRT_2;

/// Returns whether the bin at normalised radius `radius` is removed.
///
/// A non-positive threshold keeps every bin. A positive threshold always
/// removes the DC bin, and thresholds at or above the corner radius remove
/// the whole spectrum.
fn suppressed(radius: f64, threshold: f64) -> bool {
    threshold > 0.0 && (radius < threshold || threshold >= FRAC_1_SQRT_2)
}

fn apply(stack: &mut Array3<f64>, threshold_of: impl Fn(usize) -> f64 + Sync) {
    let n = stack.dim().1 as f64;
    filter_stack(stack, |index, spectrum| {
        let threshold = threshold_of(index);
        if threshold <= 0.0 {
            return;
        }
        for_each_bin(spectrum, |kx, ky, bin| {
            if suppressed((kx / n).hypot(ky / n), threshold) {
                *bin = Complex64::default();
            }
        });
    });
}

/// Ideal high-pass filter with one threshold, in cycles per pixel, for the whole stack.
pub fn highpass2d(stack: &mut Array3<f64>, threshold: f64) {
    if threshold <= 0.0 {
        return;
    }
    apply(stack, |_| threshold);
}

/// Ideal high-pass filter with a separate threshold for every image.
///
/// # Panics
///
/// Panics if `thresholds` does not hold one entry per image.
pub fn highpass2d_per_image(stack: &mut Array3<f64>, thresholds: &[f64]) {
    assert_eq!(
        stack.len_of(Axis(0)),
        thresholds.len(),
        "one threshold per image is required"
    );
    apply(stack, |index| thresholds[index]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_stack(m: usize, n: usize) -> Array3<f64> {
        Array3::from_shape_fn((m, n, n), |(z, y, x)| {
            ((x * 31 + y * 17 + z * 7) % 13) as f64 / 13.0 + 0.5
        })
    }

    #[test]
    fn zero_threshold_is_identity() {
        let original = noise_stack(2, 16);
        let mut stack = original.clone();
        highpass2d(&mut stack, 0.0);
        assert_eq!(stack, original);
    }

    #[test]
    fn threshold_beyond_corner_zeroes_everything() {
        for threshold in [FRAC_1_SQRT_2, 0.75, 2.0] {
            let mut stack = noise_stack(2, 16);
            highpass2d(&mut stack, threshold);
            assert!(stack.iter().all(|&v| v == 0.0), "threshold {threshold}");
        }
    }

    #[test]
    fn any_positive_threshold_removes_the_mean() {
        let mut stack = noise_stack(1, 16);
        highpass2d(&mut stack, 1e-6);
        assert!(stack.sum().abs() < 1e-9);
        assert!(stack.iter().any(|v| v.abs() > 1e-3));
    }

    #[test]
    fn per_image_thresholds_are_applied_independently() {
        let original = noise_stack(3, 8);
        let mut stack = original.clone();
        highpass2d_per_image(&mut stack, &[0.0, 1.0, 0.2]);

        let untouched = stack.index_axis(Axis(0), 0);
        for (a, b) in untouched.iter().zip(original.index_axis(Axis(0), 0).iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!(stack.index_axis(Axis(0), 1).iter().all(|&v| v == 0.0));
        assert!(stack.index_axis(Axis(0), 2).sum().abs() < 1e-9);
    }

    #[test]
    fn suppression_rule_matches_radius_comparison() {
        assert!(!suppressed(0.0, 0.0));
        assert!(suppressed(0.0, 0.01));
        assert!(suppressed(0.1, 0.2));
        assert!(!suppressed(0.3, 0.2));
        assert!(suppressed(FRAC_1_SQRT_2, FRAC_1_SQRT_2));
    }
}
