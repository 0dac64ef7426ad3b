use nalgebra::{Quaternion, UnitQuaternion, Vector2};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Number of scalar fields in the flattened [`ParticleRecord`] layout.
pub const RECORD_WIDTH: usize = 14;

/// Contrast transfer function parameters of a single particle image.
///
/// All quantities are stored in the units the Fourier kernels consume directly,
/// so no conversion happens inside the per-frequency loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CtfParams {
    /// Accelerating voltage in volts.
    pub voltage: f64,
    /// Defocus along the major axis in Angstroms.
    pub defocus_u: f64,
    /// Defocus along the minor axis in Angstroms.
    pub defocus_v: f64,
    /// Astigmatism angle in radians.
    pub astigmatism: f64,
    /// Spherical aberration in Angstroms.
    pub spherical_aberration: f64,
    /// Fraction of amplitude contrast, in `[0, 1]`.
    pub amplitude_contrast: f64,
    /// Additional phase shift in radians.
    pub phase_shift: f64,
    /// Pixel size in Angstroms per pixel.
    pub pixel_size: f64,
}

impl CtfParams {
    /// Relativistic electron wavelength in Angstroms for the stored voltage.
    pub fn wavelength(&self) -> f64 {
        12.2643247 / (self.voltage * (1.0 + self.voltage * 0.978466e-6)).sqrt()
    }
}

/// The derived per-particle parameter record used by the scoring engine.
///
/// A record is always fully populated. Optional inputs of the metadata file
/// (phase shift, random subset) fall back to deterministic defaults before a
/// record is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleRecord {
    /// In-plane shift of the particle in pixels.
    pub shift: Vector2<f64>,
    /// Orientation of the particle relative to the reference volume.
    pub orientation: UnitQuaternion<f64>,
    /// Optical parameters of the micrograph the particle was picked from.
    pub ctf: CtfParams,
}

impl ParticleRecord {
    /// Flattens the record into its fixed-width numeric layout.
    ///
    /// The order is `dx, dy, qw, qx, qy, qz, voltage, defocusU, defocusV,
    /// astigmatism, Cs, amplitude contrast, phase shift, pixel size`.
    pub fn to_array(&self) -> [f64; RECORD_WIDTH] {
        let q = self.orientation.quaternion();
        [
            self.shift.x,
            self.shift.y,
            q.w,
            q.i,
            q.j,
            q.k,
            self.ctf.voltage,
            self.ctf.defocus_u,
            self.ctf.defocus_v,
            self.ctf.astigmatism,
            self.ctf.spherical_aberration,
            self.ctf.amplitude_contrast,
            self.ctf.phase_shift,
            self.ctf.pixel_size,
        ]
    }
}

/// Builds the particle orientation from RELION Euler angles given in degrees.
///
/// The rotation angle plays the role of `psi`, the tilt of `theta` and the
/// in-plane psi angle of `phi` in the half-angle formulas below.
///
/// # Arguments
///
/// * `rot` - The first Euler angle (`rlnAngleRot`) in degrees.
/// * `tilt` - The second Euler angle (`rlnAngleTilt`) in degrees.
/// * `psi` - The third Euler angle (`rlnAnglePsi`) in degrees.
///
/// # Return
///
/// A unit quaternion whose rotation matrix maps volume coordinates onto the
/// projection plane of the particle.
pub fn euler_to_quaternion(rot: f64, tilt: f64, psi: f64) -> UnitQuaternion<f64> {
    let psi_ = rot.to_radians();
    let theta = tilt.to_radians();
    let phi = psi.to_radians();

    let w = ((phi + psi_) / 2.0).cos() * (theta / 2.0).cos();
    let x = -((phi - psi_) / 2.0).sin() * (theta / 2.0).sin();
    let y = -((phi - psi_) / 2.0).cos() * (theta / 2.0).sin();
    let z = -((phi + psi_) / 2.0).sin() * (theta / 2.0).cos();

    // The half-angle products are already unit length.
    UnitQuaternion::new_unchecked(Quaternion::new(w, x, y, z))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("image locator '{0}' must have the form '<slice>@<path>'")]
    MissingSeparator(String),
    #[error("invalid slice number in image locator '{0}'")]
    InvalidSlice(String),
}

/// Location of a particle image inside an image stack on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageLocator {
    /// Zero-based slice index within the stack.
    pub slice: usize,
    /// Path of the stack file as written in the metadata file.
    pub path: PathBuf,
}

impl ImageLocator {
    /// Resolves the stack path against the particle directory.
    ///
    /// Absolute stack paths are returned unchanged.
    pub fn resolve(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.path)
    }
}

impl FromStr for ImageLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (slice, path) = s
            .split_once('@')
            .ok_or_else(|| LocatorError::MissingSeparator(s.to_string()))?;
        let one_based: usize = slice
            .trim()
            .parse()
            .map_err(|_| LocatorError::InvalidSlice(s.to_string()))?;
        if one_based == 0 {
            return Err(LocatorError::InvalidSlice(s.to_string()));
        }
        // Extra '@' separators are not part of the path.
        let path = path.split('@').next().unwrap_or(path);
        Ok(Self {
            slice: one_based - 1,
            path: PathBuf::from(path),
        })
    }
}
