use super::fourier::{filter_stack, for_each_bin};
use crate::core::models::particle::CtfParams;
use ndarray::Array3;
use std::f64::consts::PI;

impl CtfParams {
    /// Value of the contrast transfer function at frequency `(kx, ky)` of an
    /// `n x n` image, with frequencies given in bins.
    pub fn transfer(&self, kx: f64, ky: f64, n: usize) -> f64 {
        let wavelength = self.wavelength();
        let scale = self.pixel_size * n as f64;
        let f = (kx / scale).hypot(ky / scale);
        let alpha = ky.atan2(kx) - self.astigmatism;
        let defocus =
            -(self.defocus_u + self.defocus_v + (self.defocus_u - self.defocus_v) * (2.0 * alpha).cos())
                / 2.0;
        let chi = PI * wavelength * defocus * f.powi(2)
            + PI / 2.0 * self.spherical_aberration * wavelength.powi(3) * f.powi(4)
            - self.phase_shift;
        let contrast = self.amplitude_contrast;
        -(1.0 - contrast * contrast).sqrt() * chi.sin() + contrast * chi.cos()
    }
}

/// Multiplies the spectrum of every image by its CTF raised to `order`.
///
/// # Panics
///
/// Panics if `ctfs` does not hold one entry per image.
pub fn convolute_ctf(stack: &mut Array3<f64>, ctfs: &[CtfParams], order: i32) {
    assert_eq!(stack.len_of(ndarray::Axis(0)), ctfs.len(), "one CTF per image is required");
    let n = stack.dim().1;
    filter_stack(stack, |index, spectrum| {
        let ctf = &ctfs[index];
        for_each_bin(spectrum, |kx, ky, bin| {
            *bin *= ctf.transfer(kx, ky, n).powi(order);
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctf(amplitude_contrast: f64, phase_shift: f64) -> CtfParams {
        CtfParams {
            voltage: 300_000.0,
            defocus_u: 12_000.0,
            defocus_v: 11_000.0,
            astigmatism: 0.3,
            spherical_aberration: 2.7e7,
            amplitude_contrast,
            phase_shift,
            pixel_size: 1.2,
        }
    }

    #[test]
    fn order_zero_is_identity() {
        let original = Array3::from_shape_fn((2, 8, 8), |(z, y, x)| (z + y * x) as f64);
        let mut stack = original.clone();
        convolute_ctf(&mut stack, &[ctf(0.1, 0.0), ctf(0.07, 0.4)], 0);
        for (a, b) in original.iter().zip(stack.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn amplitude_contrast_alone_keeps_the_mean() {
        let mut stack = Array3::from_elem((1, 8, 8), 3.0);
        convolute_ctf(&mut stack, &[ctf(1.0, 0.0)], 1);
        assert!(stack.iter().all(|v| (v - 3.0).abs() < 1e-10));
    }

    #[test]
    fn pure_phase_contrast_removes_the_mean() {
        let mut stack = Array3::from_elem((1, 8, 8), 3.0);
        convolute_ctf(&mut stack, &[ctf(0.0, 0.0)], 1);
        assert!(stack.iter().all(|v| v.abs() < 1e-10));
    }

    #[test]
    fn transfer_at_dc_depends_only_on_contrast_and_phase_shift() {
        let params = ctf(0.1, 0.5);
        let expected = -(1.0f64 - 0.01).sqrt() * (-0.5f64).sin() + 0.1 * (-0.5f64).cos();
        assert!((params.transfer(0.0, 0.0, 64) - expected).abs() < 1e-12);
    }

    #[test]
    fn transfer_is_symmetric_under_frequency_inversion() {
        let params = ctf(0.1, 0.0);
        let a = params.transfer(3.0, -5.0, 32);
        let b = params.transfer(-3.0, 5.0, 32);
        assert!((a - b).abs() < 1e-12);
    }
}
