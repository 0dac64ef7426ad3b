use nalgebra::{UnitQuaternion, Vector3};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, ArrayView3, Axis};
use tracing::trace;

/// Number of volume sections splatted by one task.
const SECTIONS_PER_TASK: usize = 4;

/// Forward-projects a cubic volume once per orientation.
///
/// Each voxel, relative to the grid centre `n / 2`, is rotated by the
/// orientation and deposited with bilinear weights onto the four nearest
/// pixels of the projection plane. Deposits falling outside the image are
/// dropped.
///
/// Sections of the volume are splatted into per-task partial images that are
/// summed in section order, so the result does not depend on scheduling.
///
/// # Panics
///
/// Panics if the volume is not cubic.
pub fn project(volume: &Array3<f64>, orientations: &[UnitQuaternion<f64>]) -> Array3<f64> {
    let (nz, ny, nx) = volume.dim();
    assert!(nz == ny && ny == nx, "volume must be cubic, got {nz}x{ny}x{nx}");
    let n = nx;
    trace!(n, images = orientations.len(), "Projecting volume.");

    let mut stack = Array3::zeros((orientations.len(), n, n));
    stack
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(orientations.par_iter())
        .for_each(|(mut image, orientation)| {
            image.assign(&project_one(volume, orientation));
        });
    stack
}

fn project_one(volume: &Array3<f64>, orientation: &UnitQuaternion<f64>) -> Array2<f64> {
    let n = volume.dim().0;
    let rotation = orientation.to_rotation_matrix();
    let rows = rotation.matrix().fixed_rows::<2>(0).into_owned();

    let partials: Vec<Array2<f64>> = volume
        .axis_chunks_iter(Axis(0), SECTIONS_PER_TASK)
        .into_par_iter()
        .enumerate()
        .map(|(chunk, slab)| {
            let mut image = Array2::zeros((n, n));
            splat(&mut image, slab, chunk * SECTIONS_PER_TASK, |p| rows * p);
            image
        })
        .collect();

    partials
        .into_iter()
        .reduce(|acc, partial| acc + partial)
        .unwrap_or_else(|| Array2::zeros((n, n)))
}

fn splat<F>(image: &mut Array2<f64>, slab: ArrayView3<f64>, z0: usize, rotate: F)
where
    F: Fn(Vector3<f64>) -> nalgebra::Vector2<f64>,
{
    let n = image.nrows();
    let half = (n / 2) as f64;
    let inside = |i: isize| i >= 0 && (i as usize) < n;

    for ((dz, y, x), &voxel) in slab.indexed_iter() {
        if voxel == 0.0 {
            continue;
        }
        let point = Vector3::new(x as f64 - half, y as f64 - half, (z0 + dz) as f64 - half);
        let target = rotate(point);
        let (vx, vy) = (target.x + half, target.y + half);
        let (fx, fy) = (vx.floor(), vy.floor());
        let (dx, dy) = (vx - fx, vy - fy);
        let (ix, iy) = (fx as isize, fy as isize);

        for (oy, wy) in [(0, 1.0 - dy), (1, dy)] {
            for (ox, wx) in [(0, 1.0 - dx), (1, dx)] {
                let (px, py) = (ix + ox, iy + oy);
                if inside(px) && inside(py) {
                    image[[py as usize, px as usize]] += voxel * wx * wy;
                }
            }
        }
    }
}
