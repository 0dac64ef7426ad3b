use crate::core::io::mrc::MrcStack;
use crate::core::models::set::ParticleSet;
use crate::engine::error::EngineError;
use crossbeam_channel::{bounded, unbounded};
use ndarray::Array3;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ops::Range;
use std::path::PathBuf;
use std::thread;
use tracing::trace;

/// Upper bound on image stacks a loader keeps open at once.
const MAX_OPEN_STACKS: usize = 32;

/// A contiguous run of particle images, placed by its offset in the view.
#[derive(Debug)]
pub struct Batch {
    /// Position of the first image within the particle view.
    pub offset: usize,
    pub images: Array3<f64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.len_of(ndarray::Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn positions(&self) -> Range<usize> {
        self.offset..self.offset + self.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchOptions {
    pub batch_size: usize,
    pub loaders: usize,
    /// Side length every image must have.
    pub image_size: usize,
}

/// Splits `range` into consecutive batches of at most `batch_size` positions.
pub fn batch_ranges(range: Range<usize>, batch_size: usize) -> Vec<Range<usize>> {
    let step = batch_size.max(1);
    range
        .clone()
        .step_by(step)
        .map(|start| start..(start + step).min(range.end))
        .collect()
}

struct ImageLoader<'a> {
    set: &'a ParticleSet,
    image_size: usize,
    stacks: HashMap<PathBuf, MrcStack>,
}

impl<'a> ImageLoader<'a> {
    fn new(set: &'a ParticleSet, image_size: usize) -> Self {
        Self {
            set,
            image_size,
            stacks: HashMap::new(),
        }
    }

    fn load(&mut self, positions: Range<usize>) -> Result<Batch, EngineError> {
        let n = self.image_size;
        let set = self.set;
        let table = set.table();
        let mut images = Array3::zeros((positions.len(), n, n));

        for (mut slot, position) in images.outer_iter_mut().zip(positions.clone()) {
            let row = set.row(position);
            let (Some(locator), Some(path)) = (table.image(row), table.stack_path(row)) else {
                return Err(EngineError::Internal(format!("row {row} has no image locator")));
            };
            if self.stacks.len() >= MAX_OPEN_STACKS && !self.stacks.contains_key(&path) {
                self.stacks.clear();
            }
            let stack = match self.stacks.entry(path) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let stack = MrcStack::open(entry.key())?;
                    entry.insert(stack)
                }
            };
            let image = stack.read_image(locator.slice)?;
            if image.dim() != (n, n) {
                return Err(EngineError::ImageShape {
                    path: locator.path.display().to_string(),
                    slice: locator.slice,
                    found: image.dim(),
                    expected: n,
                });
            }
            slot.assign(&image);
        }
        trace!(offset = positions.start, len = positions.len(), "Loaded batch.");
        Ok(Batch {
            offset: positions.start,
            images,
        })
    }
}

/// Streams the images at `range` of a view to `consume`, reading ahead on loader threads.
///
/// Batches may reach `consume` in any order; each carries its offset. The
/// first error from a loader or from `consume` stops the stream and is
/// returned.
pub fn prefetch<F>(
    set: &ParticleSet,
    range: Range<usize>,
    options: PrefetchOptions,
    mut consume: F,
) -> Result<(), EngineError>
where
    F: FnMut(Batch) -> Result<(), EngineError>,
{
    let tasks = batch_ranges(range, options.batch_size);
    if tasks.is_empty() {
        return Ok(());
    }
    let loaders = options.loaders.clamp(1, tasks.len());

    thread::scope(|s| {
        let (task_tx, task_rx) = unbounded();
        let (batch_tx, batch_rx) = bounded::<Result<Batch, EngineError>>(2 * loaders);
        for task in tasks {
            task_tx
                .send(task)
                .map_err(|_| EngineError::Internal("prefetch task queue closed".to_string()))?;
        }
        drop(task_tx);

        for _ in 0..loaders {
            let (task_rx, batch_tx) = (task_rx.clone(), batch_tx.clone());
            s.spawn(move || {
                let mut loader = ImageLoader::new(set, options.image_size);
                for task in task_rx.iter() {
                    let result = loader.load(task);
                    let failed = result.is_err();
                    if batch_tx.send(result).is_err() || failed {
                        break;
                    }
                }
            });
        }
        drop(batch_tx);

        for result in batch_rx.iter() {
            consume(result?)?;
        }
        Ok(())
    })
}
