use crate::core::io::mrc::{self, MrcError};
use crate::core::io::star::StarFile;
use crate::core::models::set::ParticleSet;
use crate::engine::config::{BalanceStrategy, InputConfig, SieveConfig};
use crate::engine::device::{DeviceError, threads_per_device};
use crate::engine::distributed::{Collective, DistributedContext, LocalGroup};
use crate::engine::error::EngineError;
use crate::engine::prefetch::PrefetchOptions;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::scoring::score_half_set;
use crate::engine::selection::{retained_counts, select_lowest};
use ndarray::Array3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{info, instrument, warn};

/// Scores of one half-set, in the order the half-set was scored.
#[derive(Debug, Clone, PartialEq)]
pub struct HalfSetScores {
    pub half_set: u32,
    /// Table row of each scored particle.
    pub rows: Vec<usize>,
    pub scores: Vec<f64>,
    /// Whether each scored particle was retained.
    pub retained: Vec<bool>,
}

impl HalfSetScores {
    pub fn retained_count(&self) -> usize {
        self.retained.iter().filter(|&&kept| kept).count()
    }
}

#[derive(Debug, Clone)]
pub struct SieveOutcome {
    pub retained: ParticleSet,
    pub sieved: ParticleSet,
    pub half_sets: Vec<HalfSetScores>,
    pub retained_path: PathBuf,
    pub sieved_path: PathBuf,
}

#[derive(Serialize)]
struct ScoreRecord {
    half_set: u32,
    row: usize,
    score: f64,
    retained: bool,
}

/// Path of the sieved-out particles: `_sieved` is inserted before the extension.
pub fn sieved_output_path(retained_path: &Path) -> PathBuf {
    let mut name = retained_path
        .file_stem()
        .map(|stem| stem.to_os_string())
        .unwrap_or_default();
    name.push("_sieved");
    if let Some(extension) = retained_path.extension() {
        name.push(".");
        name.push(extension);
    }
    retained_path.with_file_name(name)
}

/// Reads the reference volumes, multiplied by the mask when one is configured.
pub fn load_references(input: &InputConfig) -> Result<Vec<Array3<f64>>, EngineError> {
    let mask = input.mask.as_deref().map(mrc::read_mask).transpose()?;
    let mut volumes = Vec::with_capacity(input.volumes.len());
    let mut side = None;

    for path in &input.volumes {
        let mut volume = mrc::read_volume(path)?;
        if let Some(mask) = &mask {
            volume = mrc::apply_mask(&volume, mask)?;
        }
        let (nz, ny, nx) = volume.dim();
        let expected = *side.get_or_insert(nx);
        if nz != nx || ny != nx || nx != expected {
            return Err(EngineError::VolumeShape {
                path: path.display().to_string(),
                shape: [nz, ny, nx],
                expected,
            });
        }
        volumes.push(volume);
    }
    Ok(volumes)
}

/// Writes per-particle scores as CSV with columns `half_set,row,score,retained`.
pub fn write_scores(path: &Path, half_sets: &[HalfSetScores]) -> Result<(), EngineError> {
    let mut writer = csv::Writer::from_path(path)?;
    for half_set in half_sets {
        for ((&row, &score), &retained) in half_set
            .rows
            .iter()
            .zip(&half_set.scores)
            .zip(&half_set.retained)
        {
            writer.serialize(ScoreRecord {
                half_set: half_set.half_set,
                row,
                score,
                retained,
            })?;
        }
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Sieves a particle file as one worker of a group.
///
/// Every worker loads the inputs and scores its block of each half-set; the
/// scores are summed onto the controller, which selects the retained
/// particles and writes both output files. Non-controllers return `None`
/// after the last reduction.
#[instrument(skip_all, name = "sieve_workflow", fields(rank = context.rank()))]
pub fn run(
    config: &SieveConfig,
    context: &DistributedContext,
    collective: &mut dyn Collective,
    reporter: &ProgressReporter,
) -> Result<Option<SieveOutcome>, EngineError> {
    if collective.world_size() != context.world_size() || collective.rank() != context.rank() {
        return Err(EngineError::Internal(format!(
            "collective is rank {} of {}, context is rank {} of {}",
            collective.rank(),
            collective.world_size(),
            context.rank(),
            context.world_size()
        )));
    }

    // === Phase 1: Load inputs ===
    reporter.report(Progress::PhaseStart { name: "Loading" });
    let input = &config.input;
    let table = StarFile::load(&input.particles_path, &input.data_dir, input.pixel_size)?;
    info!(
        schema = table.schema().name(),
        particles = table.len(),
        "Loaded particle metadata."
    );
    let particles = ParticleSet::new(table);

    let half_set_ids = particles.half_set_ids();
    if half_set_ids.len() != input.volumes.len() {
        return Err(EngineError::Cardinality {
            half_sets: half_set_ids.len(),
            volumes: input.volumes.len(),
        });
    }

    let candidates = match config.selection.balance {
        BalanceStrategy::Resample { seed } => {
            let balanced = particles.balance(&mut StdRng::seed_from_u64(seed));
            info!(
                before = particles.len(),
                after = balanced.len(),
                "Balanced half-sets by random down-sampling."
            );
            balanced
        }
        BalanceStrategy::None | BalanceStrategy::Clamp => particles.clone(),
    };

    let volumes = load_references(input)?;
    let image_size = volumes.first().map_or(0, |v| v.dim().0);
    reporter.report(Progress::PhaseFinish);

    // === Phase 2: Score every half-set against its reference ===
    reporter.report(Progress::PhaseStart { name: "Scoring" });
    let options = PrefetchOptions {
        batch_size: config.execution.batch_size,
        loaders: config.execution.loader_threads,
        image_size,
    };
    let mut reduced = Vec::with_capacity(half_set_ids.len());
    for (&id, volume) in half_set_ids.iter().zip(&volumes) {
        let half_set = candidates.half_set(id);
        reporter.report(Progress::HalfSetStart {
            id,
            particles: half_set.len(),
        });
        info!(half_set = id, particles = half_set.len(), "Scoring half-set.");

        let partial = score_half_set(
            &half_set,
            volume,
            config.selection.cutoff_resolution,
            options,
            context,
            reporter,
        )?;
        if let Some(scores) = collective.reduce_sum(partial)? {
            reduced.push((id, half_set, scores));
        }
    }
    reporter.report(Progress::PhaseFinish);

    if !context.is_controller() {
        return Ok(None);
    }

    // === Phase 3: Select the best-scoring particles ===
    reporter.report(Progress::PhaseStart { name: "Selection" });
    let sizes: BTreeMap<u32, usize> = reduced
        .iter()
        .map(|(id, half_set, _)| (*id, half_set.len()))
        .collect();
    let counts = retained_counts(
        &sizes,
        config.selection.retention_ratio,
        config.selection.balance,
    );

    let mut keep = HashSet::new();
    let mut half_sets = Vec::with_capacity(reduced.len());
    for (id, half_set, scores) in reduced {
        let count = counts.get(&id).copied().unwrap_or(0);
        let mut retained = vec![false; half_set.len()];
        for position in select_lowest(&scores, count) {
            retained[position] = true;
            keep.insert(half_set.row(position));
        }
        if scores.iter().any(|s| s.is_nan()) {
            warn!(half_set = id, "Some scores are NaN; those particles rank last.");
        }
        info!(
            half_set = id,
            particles = half_set.len(),
            retained = count,
            "Selected particles."
        );
        reporter.report(Progress::Message(format!(
            "Half-set {id}: {count} of {} particles retained.",
            half_set.len()
        )));
        half_sets.push(HalfSetScores {
            half_set: id,
            rows: half_set.rows().to_vec(),
            scores,
            retained,
        });
    }

    let mask: Vec<bool> = particles.rows().iter().map(|row| keep.contains(row)).collect();
    let (retained, sieved) = particles.split(&mask);
    reporter.report(Progress::PhaseFinish);

    // === Phase 4: Write outputs ===
    reporter.report(Progress::PhaseStart { name: "Writing" });
    let retained_path = config.output.retained_path.clone();
    let sieved_path = sieved_output_path(&retained_path);
    retained.save(&retained_path)?;
    sieved.save(&sieved_path)?;
    if let Some(scores_path) = &config.output.scores_path {
        write_scores(scores_path, &half_sets)?;
    }
    info!(
        retained = retained.len(),
        sieved = sieved.len(),
        output = %retained_path.display(),
        "Sieving finished."
    );
    reporter.report(Progress::PhaseFinish);

    Ok(Some(SieveOutcome {
        retained,
        sieved,
        half_sets,
        retained_path,
        sieved_path,
    }))
}

fn is_disconnect(error: &EngineError) -> bool {
    matches!(error, EngineError::Device(DeviceError::Disconnected { .. }))
}

/// Runs a sieve with `workers` in-process workers, each on its own device.
///
/// `threads` is the total number of compute threads shared by the devices;
/// zero uses every available core.
pub fn run_local_group(
    config: &SieveConfig,
    workers: usize,
    threads: usize,
    reporter: &ProgressReporter,
) -> Result<SieveOutcome, EngineError> {
    let workers = workers.max(1);
    let per_device = threads_per_device(threads, workers);
    let mut endpoints = LocalGroup::create(workers).into_iter();
    let Some(mut controller_endpoint) = endpoints.next() else {
        return Err(EngineError::Internal("empty worker group".to_string()));
    };

    thread::scope(|s| {
        let handles: Vec<_> = endpoints
            .map(|mut endpoint| {
                s.spawn(move || -> Result<(), EngineError> {
                    let context = DistributedContext::new(endpoint.rank(), workers, per_device)?;
                    run(config, &context, &mut endpoint, &ProgressReporter::new())?;
                    Ok(())
                })
            })
            .collect();

        let controller = DistributedContext::new(0, workers, per_device)
            .map_err(EngineError::from)
            .and_then(|context| run(config, &context, &mut controller_endpoint, reporter));
        drop(controller_endpoint);

        let mut worker_error = None;
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(DeviceError::WorkerPanicked { rank: i + 1 }.into()));
            if let Err(e) = result {
                worker_error.get_or_insert(e);
            }
        }

        match controller {
            Ok(Some(outcome)) => match worker_error {
                Some(e) => Err(e),
                None => Ok(outcome),
            },
            Ok(None) => Err(EngineError::Internal(
                "controller finished without an outcome".to_string(),
            )),
            Err(e) if is_disconnect(&e) => Err(worker_error.unwrap_or(e)),
            Err(e) => Err(e),
        }
    })
}
