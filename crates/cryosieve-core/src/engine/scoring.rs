use super::distributed::DistributedContext;
use super::error::EngineError;
use super::prefetch::{PrefetchOptions, batch_ranges, prefetch};
use super::progress::{Progress, ProgressReporter};
use crate::core::kernels::{convolute_ctf, highpass2d_per_image, project, translate};
use crate::core::models::particle::ParticleRecord;
use crate::core::models::set::ParticleSet;
use ndarray::{Array3, ArrayView2, Axis, Zip};
use tracing::{debug, instrument};

fn energy(image: ArrayView2<f64>) -> f64 {
    image.iter().map(|v| v * v).sum()
}

/// Disagreement scores of a batch of images against a reference volume.
///
/// Each image is re-centred by its stored shift and compared with the
/// CTF-modulated projection of the volume at its stored orientation. Both the
/// residual and the centred image are high-pass filtered at
/// `pixel_size / cutoff_resolution`, and the score is the residual energy
/// minus the image energy. Lower scores indicate better agreement.
///
/// # Panics
///
/// Panics if `records` and `images` differ in length.
pub fn score_batch(
    volume: &Array3<f64>,
    records: &[ParticleRecord],
    mut images: Array3<f64>,
    cutoff_resolution: f64,
) -> Vec<f64> {
    assert_eq!(images.len_of(Axis(0)), records.len(), "one record per image is required");

    let shifts: Vec<_> = records.iter().map(|r| r.shift).collect();
    let orientations: Vec<_> = records.iter().map(|r| r.orientation).collect();
    let ctfs: Vec<_> = records.iter().map(|r| r.ctf).collect();
    let thresholds: Vec<_> = records
        .iter()
        .map(|r| r.ctf.pixel_size / cutoff_resolution)
        .collect();

    translate(&mut images, &shifts);
    let mut residual = project(volume, &orientations);
    convolute_ctf(&mut residual, &ctfs, 1);
    Zip::from(&mut residual).and(&images).par_for_each(|r, &i| *r -= i);

    highpass2d_per_image(&mut images, &thresholds);
    highpass2d_per_image(&mut residual, &thresholds);

    residual
        .outer_iter()
        .zip(images.outer_iter())
        .map(|(r, i)| energy(r) - energy(i))
        .collect()
}

/// Scores this worker's block of a half-set.
///
/// Returns a vector covering the whole half-set in view order, with zeros
/// outside the block assigned to this worker, ready for sum-reduction.
#[instrument(skip_all, fields(rank = context.rank(), particles = half_set.len()))]
pub fn score_half_set(
    half_set: &ParticleSet,
    volume: &Array3<f64>,
    cutoff_resolution: f64,
    options: PrefetchOptions,
    context: &DistributedContext,
    reporter: &ProgressReporter,
) -> Result<Vec<f64>, EngineError> {
    let block = context.block(half_set.len());
    let mut scores = vec![0.0; half_set.len()];
    debug!(start = block.start, end = block.end, "Scoring block.");

    reporter.report(Progress::TaskStart {
        total_steps: batch_ranges(block.clone(), options.batch_size).len() as u64,
    });
    prefetch(half_set, block, options, |batch| {
        let records: Vec<ParticleRecord> =
            batch.positions().map(|p| *half_set.record(p)).collect();
        let range = batch.positions();
        let batch_scores = context
            .device()
            .install(|| score_batch(volume, &records, batch.images, cutoff_resolution));
        scores[range].copy_from_slice(&batch_scores);
        reporter.report(Progress::TaskIncrement);
        Ok(())
    })?;
    reporter.report(Progress::TaskFinish);

    Ok(scores)
}
