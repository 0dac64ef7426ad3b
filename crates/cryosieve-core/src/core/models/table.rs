use super::particle::{ImageLocator, ParticleRecord};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Half-set id assigned to particles whose metadata carries no random subset.
pub const DEFAULT_HALF_SET: u32 = 1;

/// Physical parameters shared by all particles of an optics group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpticsGroup {
    pub id: u32,
    /// Accelerating voltage in kilovolts, as written in the optics block.
    pub voltage: f64,
    /// Pixel size in Angstroms per pixel.
    pub pixel_size: f64,
    /// Spherical aberration in millimetres, as written in the optics block.
    pub spherical_aberration: f64,
    pub amplitude_contrast: f64,
}

/// The metadata schema a table was read in.
///
/// The variant is decided once while loading. Records are resolved eagerly,
/// so downstream code never branches on the schema when reading parameters;
/// the tag only matters for reporting and for writing the table back out.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// A single `data_` / `data_images` block with per-row physical parameters.
    Legacy,
    /// `data_optics` and `data_particles` blocks joined on the optics group id.
    Joined { optics: Vec<OpticsGroup> },
}

impl Schema {
    pub fn name(&self) -> &'static str {
        match self {
            Schema::Legacy => "legacy",
            Schema::Joined { .. } => "optics-joined",
        }
    }
}

/// Verbatim text of the metadata file a table was parsed from.
///
/// Particle rows are remembered by their line index so that a filtered table
/// can be written back by copying the source and omitting dropped rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceText {
    /// Source lines including their original line terminators.
    pub lines: Vec<String>,
    /// Line index of each particle row, in row order.
    pub row_lines: Vec<usize>,
}

/// An immutable, fully resolved particle metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleTable {
    schema: Schema,
    records: Vec<ParticleRecord>,
    images: Vec<ImageLocator>,
    half_sets: Vec<u32>,
    data_dir: PathBuf,
    source: SourceText,
}

impl ParticleTable {
    /// Assembles a table from resolved per-row columns.
    ///
    /// # Panics
    ///
    /// Panics if the per-row columns differ in length. Parsers build all
    /// columns in a single pass, so a mismatch is a programming error.
    pub fn new(
        schema: Schema,
        records: Vec<ParticleRecord>,
        images: Vec<ImageLocator>,
        half_sets: Vec<u32>,
        data_dir: PathBuf,
        source: SourceText,
    ) -> Self {
        assert_eq!(records.len(), images.len());
        assert_eq!(records.len(), half_sets.len());
        assert_eq!(records.len(), source.row_lines.len());
        Self {
            schema,
            records,
            images,
            half_sets,
            data_dir,
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn records(&self) -> &[ParticleRecord] {
        &self.records
    }

    pub fn record(&self, row: usize) -> Option<&ParticleRecord> {
        self.records.get(row)
    }

    pub fn image(&self, row: usize) -> Option<&ImageLocator> {
        self.images.get(row)
    }

    pub fn half_set(&self, row: usize) -> Option<u32> {
        self.half_sets.get(row).copied()
    }

    pub fn half_sets(&self) -> &[u32] {
        &self.half_sets
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn source(&self) -> &SourceText {
        &self.source
    }

    /// Resolved on-disk path of the stack holding a row's image.
    pub fn stack_path(&self, row: usize) -> Option<PathBuf> {
        self.images.get(row).map(|image| image.resolve(&self.data_dir))
    }

    /// Counts rows per half-set id, ordered by ascending id.
    pub fn half_set_sizes(&self) -> BTreeMap<u32, usize> {
        let mut sizes = BTreeMap::new();
        for &id in &self.half_sets {
            *sizes.entry(id).or_insert(0) += 1;
        }
        sizes
    }
}
