use crate::core::io::traits::ParticleFile;
use crate::core::models::particle::{
    CtfParams, ImageLocator, LocatorError, ParticleRecord, euler_to_quaternion,
};
use crate::core::models::set::ParticleSet;
use crate::core::models::table::{
    DEFAULT_HALF_SET, OpticsGroup, ParticleTable, Schema, SourceText,
};
use nalgebra::Vector2;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

const LEGACY_REQUIRED_KEYS: [&str; 12] = [
    "rlnOriginX",
    "rlnOriginY",
    "rlnAngleRot",
    "rlnAngleTilt",
    "rlnAnglePsi",
    "rlnVoltage",
    "rlnDefocusU",
    "rlnDefocusV",
    "rlnDefocusAngle",
    "rlnSphericalAberration",
    "rlnAmplitudeContrast",
    "rlnImageName",
];

const OPTICS_REQUIRED_KEYS: [&str; 5] = [
    "rlnOpticsGroup",
    "rlnVoltage",
    "rlnImagePixelSize",
    "rlnSphericalAberration",
    "rlnAmplitudeContrast",
];

const PARTICLES_REQUIRED_KEYS: [&str; 10] = [
    "rlnOriginXAngst",
    "rlnOriginYAngst",
    "rlnAngleRot",
    "rlnAngleTilt",
    "rlnAnglePsi",
    "rlnDefocusU",
    "rlnDefocusV",
    "rlnDefocusAngle",
    "rlnOpticsGroup",
    "rlnImageName",
];

/// Conversion factor from millimetres to Angstroms for spherical aberration.
const MM_TO_ANGSTROM: f64 = 1e7;

#[derive(Debug, Error)]
pub enum StarError {
    #[error("Input file '{}' does not exist", path.display())]
    NotFound { path: PathBuf },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Schema error on line {line}: {kind}")]
    Schema { line: usize, kind: SchemaErrorKind },
    #[error("Key '{key}' missing in block 'data_{block}'")]
    MissingKey { block: String, key: &'static str },
    #[error("Particle on line {line} references optics group {group}, which is {reason}")]
    Join {
        line: usize,
        group: u32,
        reason: JoinFailure,
    },
}

#[derive(Debug, Error)]
pub enum SchemaErrorKind {
    #[error("invalid block 'data_{0}'")]
    UnrecognisedBlock(String),
    #[error("'{0}' outside of a data block")]
    OutsideBlock(String),
    #[error("key '{0}' occurs more than once in the same block")]
    DuplicateKey(String),
    #[error("row has {found} fields but the loop declares {expected} keys")]
    ShortRow { expected: usize, found: usize },
    #[error("unexpected content '{0}'")]
    UnexpectedLine(String),
    #[error("invalid value '{value}' for key '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Locator(#[from] LocatorError),
    #[error("block 'data_{0}' must be a loop")]
    NotALoop(String),
    #[error("no particle block found")]
    NoParticleBlock,
    #[error("block 'data_{0}' requires a matching 'data_{1}' block")]
    UnpairedBlock(String, &'static str),
    #[error("no pixel size available: pass one explicitly or provide 'rlnImagePixelSize'")]
    MissingPixelSize,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    #[error("not defined in the optics block")]
    Undefined,
    #[error("defined {0} times in the optics block")]
    Ambiguous(usize),
}

/// Options for resolving a STAR file into particle records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarLoadOptions {
    /// Directory that relative image stack paths are resolved against.
    pub data_dir: PathBuf,
    /// Pixel size in Angstroms for files whose schema carries none.
    pub pixel_size: Option<f64>,
}

#[derive(Debug, Clone)]
struct StarRow {
    line: usize,
    fields: Vec<String>,
}

#[derive(Debug, Clone)]
struct StarBlock {
    name: String,
    line: usize,
    is_loop: bool,
    labels: Vec<String>,
    rows: Vec<StarRow>,
}

impl StarBlock {
    fn new(name: &str, line: usize) -> Self {
        Self {
            name: name.to_string(),
            line,
            is_loop: false,
            labels: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn column(&self, key: &str) -> Option<usize> {
        self.labels.iter().position(|label| label == key)
    }

    fn require(&self, key: &'static str) -> Result<usize, StarError> {
        self.column(key).ok_or_else(|| StarError::MissingKey {
            block: self.name.clone(),
            key,
        })
    }

    fn add_label(&mut self, label: &str, line: usize) -> Result<(), StarError> {
        if self.column(label).is_some() {
            return Err(StarError::Schema {
                line,
                kind: SchemaErrorKind::DuplicateKey(label.to_string()),
            });
        }
        self.labels.push(label.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Outside,
    InBlock,
    LoopLabels,
    LoopRows,
}

/// Tokenised STAR document that keeps its source text verbatim.
#[derive(Debug, Clone)]
struct StarDocument {
    lines: Vec<String>,
    blocks: Vec<StarBlock>,
}

impl StarDocument {
    fn parse(content: &str) -> Result<Self, StarError> {
        let lines: Vec<String> = content.split_inclusive('\n').map(str::to_owned).collect();
        let mut blocks: Vec<StarBlock> = Vec::new();
        let mut state = ParseState::Outside;

        for (index, raw) in lines.iter().enumerate() {
            let line_num = index + 1;
            let line = raw.trim();

            if line.is_empty() {
                if state == ParseState::LoopRows {
                    state = ParseState::InBlock;
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("data_") {
                let name = rest.split_whitespace().next().unwrap_or("");
                blocks.push(StarBlock::new(name, line_num));
                state = ParseState::InBlock;
                continue;
            }

            let Some(block) = blocks.last_mut() else {
                return Err(StarError::Schema {
                    line: line_num,
                    kind: SchemaErrorKind::OutsideBlock(line.to_string()),
                });
            };

            if line.starts_with("loop_") {
                if block.is_loop || !block.labels.is_empty() {
                    return Err(StarError::Schema {
                        line: line_num,
                        kind: SchemaErrorKind::UnexpectedLine(line.to_string()),
                    });
                }
                block.is_loop = true;
                state = ParseState::LoopLabels;
                continue;
            }

            let mut tokens = line.split_whitespace();
            let first = tokens.next().unwrap_or("");

            match (state, first.strip_prefix('_')) {
                (ParseState::LoopLabels, Some(label)) => {
                    block.add_label(label, line_num)?;
                }
                (ParseState::InBlock, Some(label)) if !block.is_loop => {
                    let value = tokens.next().ok_or_else(|| StarError::Schema {
                        line: line_num,
                        kind: SchemaErrorKind::UnexpectedLine(line.to_string()),
                    })?;
                    block.add_label(label, line_num)?;
                    match block.rows.first_mut() {
                        Some(row) => row.fields.push(value.to_string()),
                        None => block.rows.push(StarRow {
                            line: index,
                            fields: vec![value.to_string()],
                        }),
                    }
                }
                (ParseState::LoopLabels | ParseState::LoopRows, None) => {
                    let fields: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
                    if fields.len() < block.labels.len() {
                        return Err(StarError::Schema {
                            line: line_num,
                            kind: SchemaErrorKind::ShortRow {
                                expected: block.labels.len(),
                                found: fields.len(),
                            },
                        });
                    }
                    block.rows.push(StarRow {
                        line: index,
                        fields,
                    });
                    state = ParseState::LoopRows;
                }
                _ => {
                    return Err(StarError::Schema {
                        line: line_num,
                        kind: SchemaErrorKind::UnexpectedLine(line.to_string()),
                    });
                }
            }
        }

        Ok(Self { lines, blocks })
    }

    fn block(&self, name: &str) -> Option<&StarBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }
}

fn parse_field<T: FromStr>(
    row: &StarRow,
    column: usize,
    key: &str,
) -> Result<T, StarError> {
    let value = field(row, column)?;
    value.parse().map_err(|_| StarError::Schema {
        line: row.line + 1,
        kind: SchemaErrorKind::InvalidValue {
            key: key.to_string(),
            value: value.clone(),
        },
    })
}

fn field(row: &StarRow, column: usize) -> Result<&String, StarError> {
    row.fields.get(column).ok_or_else(|| StarError::Schema {
        line: row.line + 1,
        kind: SchemaErrorKind::ShortRow {
            expected: column + 1,
            found: row.fields.len(),
        },
    })
}

fn parse_optional<T: FromStr>(
    row: &StarRow,
    column: Option<usize>,
    key: &str,
) -> Result<Option<T>, StarError> {
    column.map(|c| parse_field(row, c, key)).transpose()
}

fn parse_locator(row: &StarRow, column: usize) -> Result<ImageLocator, StarError> {
    field(row, column)?
        .parse()
        .map_err(|e: LocatorError| StarError::Schema {
            line: row.line + 1,
            kind: e.into(),
        })
}

/// Column indices shared by both particle block layouts.
struct PoseColumns {
    origin_x: usize,
    origin_y: usize,
    rot: usize,
    tilt: usize,
    psi: usize,
    defocus_u: usize,
    defocus_v: usize,
    defocus_angle: usize,
    image: usize,
    phase_shift: Option<usize>,
    half_set: Option<usize>,
}

impl PoseColumns {
    fn locate(block: &StarBlock, origin_keys: [&'static str; 2]) -> Result<Self, StarError> {
        Ok(Self {
            origin_x: block.require(origin_keys[0])?,
            origin_y: block.require(origin_keys[1])?,
            rot: block.require("rlnAngleRot")?,
            tilt: block.require("rlnAngleTilt")?,
            psi: block.require("rlnAnglePsi")?,
            defocus_u: block.require("rlnDefocusU")?,
            defocus_v: block.require("rlnDefocusV")?,
            defocus_angle: block.require("rlnDefocusAngle")?,
            image: block.require("rlnImageName")?,
            phase_shift: block.column("rlnPhaseShift"),
            half_set: block.column("rlnRandomSubset"),
        })
    }
}

/// Physical parameters resolved for one particle row before it becomes a record.
struct Optics {
    voltage_kv: f64,
    cs_mm: f64,
    amplitude_contrast: f64,
    pixel_size: f64,
}

#[derive(Default)]
struct TableColumns {
    records: Vec<ParticleRecord>,
    images: Vec<ImageLocator>,
    half_sets: Vec<u32>,
    row_lines: Vec<usize>,
}

impl TableColumns {
    fn push_row(
        &mut self,
        row: &StarRow,
        columns: &PoseColumns,
        optics: &Optics,
        origin_scale: f64,
    ) -> Result<(), StarError> {
        let dx: f64 = parse_field(row, columns.origin_x, "origin x")?;
        let dy: f64 = parse_field(row, columns.origin_y, "origin y")?;
        let rot: f64 = parse_field(row, columns.rot, "rlnAngleRot")?;
        let tilt: f64 = parse_field(row, columns.tilt, "rlnAngleTilt")?;
        let psi: f64 = parse_field(row, columns.psi, "rlnAnglePsi")?;
        let defocus_angle: f64 = parse_field(row, columns.defocus_angle, "rlnDefocusAngle")?;
        let phase_shift: f64 =
            parse_optional(row, columns.phase_shift, "rlnPhaseShift")?.unwrap_or(0.0);

        self.records.push(ParticleRecord {
            shift: Vector2::new(dx * origin_scale, dy * origin_scale),
            orientation: euler_to_quaternion(rot, tilt, psi),
            ctf: CtfParams {
                voltage: optics.voltage_kv * 1000.0,
                defocus_u: parse_field(row, columns.defocus_u, "rlnDefocusU")?,
                defocus_v: parse_field(row, columns.defocus_v, "rlnDefocusV")?,
                astigmatism: defocus_angle.to_radians(),
                spherical_aberration: optics.cs_mm * MM_TO_ANGSTROM,
                amplitude_contrast: optics.amplitude_contrast,
                phase_shift: phase_shift.to_radians(),
                pixel_size: optics.pixel_size,
            },
        });
        self.images.push(parse_locator(row, columns.image)?);
        self.half_sets.push(
            parse_optional(row, columns.half_set, "rlnRandomSubset")?.unwrap_or(DEFAULT_HALF_SET),
        );
        self.row_lines.push(row.line);
        Ok(())
    }
}

fn resolve_legacy(
    block: &StarBlock,
    options: &StarLoadOptions,
) -> Result<(Schema, TableColumns), StarError> {
    for key in LEGACY_REQUIRED_KEYS {
        block.require(key)?;
    }
    let columns = PoseColumns::locate(block, ["rlnOriginX", "rlnOriginY"])?;
    let voltage = block.require("rlnVoltage")?;
    let cs = block.require("rlnSphericalAberration")?;
    let amplitude_contrast = block.require("rlnAmplitudeContrast")?;
    let pixel_size_column = block.column("rlnImagePixelSize");

    let mut table = TableColumns::default();
    for row in &block.rows {
        let pixel_size = match options.pixel_size {
            Some(pixel_size) => pixel_size,
            None => parse_optional(row, pixel_size_column, "rlnImagePixelSize")?.ok_or(
                StarError::Schema {
                    line: row.line + 1,
                    kind: SchemaErrorKind::MissingPixelSize,
                },
            )?,
        };
        let optics = Optics {
            voltage_kv: parse_field(row, voltage, "rlnVoltage")?,
            cs_mm: parse_field(row, cs, "rlnSphericalAberration")?,
            amplitude_contrast: parse_field(row, amplitude_contrast, "rlnAmplitudeContrast")?,
            pixel_size,
        };
        table.push_row(row, &columns, &optics, 1.0)?;
    }
    Ok((Schema::Legacy, table))
}

fn parse_optics_groups(block: &StarBlock) -> Result<Vec<OpticsGroup>, StarError> {
    for key in OPTICS_REQUIRED_KEYS {
        block.require(key)?;
    }
    let id = block.require("rlnOpticsGroup")?;
    let voltage = block.require("rlnVoltage")?;
    let pixel_size = block.require("rlnImagePixelSize")?;
    let cs = block.require("rlnSphericalAberration")?;
    let amplitude_contrast = block.require("rlnAmplitudeContrast")?;

    block
        .rows
        .iter()
        .map(|row| {
            Ok(OpticsGroup {
                id: parse_field(row, id, "rlnOpticsGroup")?,
                voltage: parse_field(row, voltage, "rlnVoltage")?,
                pixel_size: parse_field(row, pixel_size, "rlnImagePixelSize")?,
                spherical_aberration: parse_field(row, cs, "rlnSphericalAberration")?,
                amplitude_contrast: parse_field(row, amplitude_contrast, "rlnAmplitudeContrast")?,
            })
        })
        .collect()
}

fn resolve_joined(
    optics_block: &StarBlock,
    particles: &StarBlock,
    options: &StarLoadOptions,
) -> Result<(Schema, TableColumns), StarError> {
    if !particles.is_loop {
        return Err(StarError::Schema {
            line: particles.line,
            kind: SchemaErrorKind::NotALoop(particles.name.clone()),
        });
    }
    let groups = parse_optics_groups(optics_block)?;
    for key in PARTICLES_REQUIRED_KEYS {
        particles.require(key)?;
    }
    let columns = PoseColumns::locate(particles, ["rlnOriginXAngst", "rlnOriginYAngst"])?;
    let group_column = particles.require("rlnOpticsGroup")?;

    let mut by_id: HashMap<u32, Vec<&OpticsGroup>> = HashMap::new();
    for group in &groups {
        by_id.entry(group.id).or_default().push(group);
    }

    if let Some(pixel_size) = options.pixel_size {
        if groups.iter().any(|g| (g.pixel_size - pixel_size).abs() > 1e-6) {
            warn!(
                pixel_size,
                "Ignoring explicit pixel size; the optics block defines its own."
            );
        }
    }

    let mut table = TableColumns::default();
    for row in &particles.rows {
        let group_id: u32 = parse_field(row, group_column, "rlnOpticsGroup")?;
        let group = match by_id.get(&group_id).map(Vec::as_slice) {
            Some([group]) => *group,
            Some(matches) => {
                return Err(StarError::Join {
                    line: row.line + 1,
                    group: group_id,
                    reason: JoinFailure::Ambiguous(matches.len()),
                });
            }
            None => {
                return Err(StarError::Join {
                    line: row.line + 1,
                    group: group_id,
                    reason: JoinFailure::Undefined,
                });
            }
        };
        let optics = Optics {
            voltage_kv: group.voltage,
            cs_mm: group.spherical_aberration,
            amplitude_contrast: group.amplitude_contrast,
            pixel_size: group.pixel_size,
        };
        table.push_row(row, &columns, &optics, 1.0 / group.pixel_size)?;
    }
    Ok((Schema::Joined { optics: groups }, table))
}

/// Reader and writer for RELION-style STAR particle metadata.
pub struct StarFile;

impl StarFile {
    /// Loads a particle table, reporting a missing input as [`StarError::NotFound`].
    pub fn load(
        path: &Path,
        data_dir: &Path,
        pixel_size: Option<f64>,
    ) -> Result<ParticleTable, StarError> {
        if !path.exists() {
            return Err(StarError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let options = StarLoadOptions {
            data_dir: data_dir.to_path_buf(),
            pixel_size,
        };
        Self::read_from_path(path, &options)
    }

    /// Writes a particle view back in the schema of its backing table.
    pub fn save(set: &ParticleSet, path: &Path) -> Result<(), StarError> {
        Self::write_to_path(set, path)
    }
}

impl ParticleFile for StarFile {
    type Options = StarLoadOptions;
    type Error = StarError;

    fn read_from(
        reader: &mut impl BufRead,
        options: &Self::Options,
    ) -> Result<ParticleTable, Self::Error> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        let document = StarDocument::parse(&content)?;

        for block in &document.blocks {
            if !matches!(block.name.as_str(), "" | "images" | "optics" | "particles") {
                return Err(StarError::Schema {
                    line: block.line,
                    kind: SchemaErrorKind::UnrecognisedBlock(block.name.clone()),
                });
            }
        }

        let (schema, columns) = match (document.block("optics"), document.block("particles")) {
            (Some(optics), Some(particles)) => resolve_joined(optics, particles, options)?,
            (Some(optics), None) => {
                return Err(StarError::Schema {
                    line: optics.line,
                    kind: SchemaErrorKind::UnpairedBlock(optics.name.clone(), "particles"),
                });
            }
            (None, Some(particles)) => {
                return Err(StarError::Schema {
                    line: particles.line,
                    kind: SchemaErrorKind::UnpairedBlock(particles.name.clone(), "optics"),
                });
            }
            (None, None) => {
                let block = document
                    .blocks
                    .first()
                    .ok_or(StarError::Schema {
                        line: document.lines.len(),
                        kind: SchemaErrorKind::NoParticleBlock,
                    })?;
                if document.blocks.len() > 1 {
                    return Err(StarError::Schema {
                        line: document.blocks[1].line,
                        kind: SchemaErrorKind::UnrecognisedBlock(document.blocks[1].name.clone()),
                    });
                }
                if !block.is_loop {
                    return Err(StarError::Schema {
                        line: block.line,
                        kind: SchemaErrorKind::NotALoop(block.name.clone()),
                    });
                }
                resolve_legacy(block, options)?
            }
        };

        debug!(
            schema = schema.name(),
            particles = columns.records.len(),
            "Parsed STAR metadata."
        );

        Ok(ParticleTable::new(
            schema,
            columns.records,
            columns.images,
            columns.half_sets,
            options.data_dir.clone(),
            SourceText {
                lines: document.lines,
                row_lines: columns.row_lines,
            },
        ))
    }

    fn write_to(set: &ParticleSet, writer: &mut impl Write) -> Result<(), Self::Error> {
        let source = set.table().source();
        let mut dropped = vec![false; source.lines.len()];
        for &line in &source.row_lines {
            dropped[line] = true;
        }
        for &row in set.rows() {
            dropped[source.row_lines[row]] = false;
        }
        for (line, skip) in source.lines.iter().zip(dropped) {
            if !skip {
                writer.write_all(line.as_bytes())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    const LEGACY_STAR: &str = "\
# RELION; version 30000

data_images

loop_
_rlnOriginX #1
_rlnOriginY #2
_rlnAngleRot #3
_rlnAngleTilt #4
_rlnAnglePsi #5
_rlnVoltage #6
_rlnDefocusU #7
_rlnDefocusV #8
_rlnDefocusAngle #9
_rlnSphericalAberration #10
_rlnAmplitudeContrast #11
_rlnImageName #12
_rlnRandomSubset #13
  1.5  -2.0   0.0   0.0   0.0  300  15000  14000  30.0  2.7  0.1  000001@stack.mrcs  1
  0.0   0.0  10.0  20.0  30.0  300  16000  15500  12.0  2.7  0.1  000002@stack.mrcs  2
 -1.0   3.0  40.0  50.0  60.0  300  17000  16000  45.0  2.7  0.1  000003@stack.mrcs  1

";

    const JOINED_STAR: &str = "\
# version 30001

data_optics

loop_
_rlnOpticsGroupName #1
_rlnOpticsGroup #2
_rlnVoltage #3
_rlnImagePixelSize #4
_rlnSphericalAberration #5
_rlnAmplitudeContrast #6
opticsGroup1 1 300.0 2.0 2.7 0.1
opticsGroup2 2 200.0 1.0 2.0 0.07

# version 30001

data_particles

loop_
_rlnImageName #1
_rlnOriginXAngst #2
_rlnOriginYAngst #3
_rlnAngleRot #4
_rlnAngleTilt #5
_rlnAnglePsi #6
_rlnDefocusU #7
_rlnDefocusV #8
_rlnDefocusAngle #9
_rlnOpticsGroup #10
_rlnRandomSubset #11
_rlnPhaseShift #12
1@Particles/a.mrcs 4.0 -2.0 0.0 0.0 0.0 10000 9000 0.0 1 1 90.0
2@Particles/a.mrcs 1.0 1.0 5.0 6.0 7.0 11000 9500 10.0 2 2 0.0
";

    fn options(pixel_size: Option<f64>) -> StarLoadOptions {
        StarLoadOptions {
            data_dir: PathBuf::from("/data"),
            pixel_size,
        }
    }

    fn read(content: &str, pixel_size: Option<f64>) -> Result<ParticleTable, StarError> {
        StarFile::read_from(&mut Cursor::new(content), &options(pixel_size))
    }

    #[test]
    fn legacy_file_resolves_records_and_defaults() {
        let table = read(LEGACY_STAR, Some(1.34)).unwrap();
        assert_eq!(table.schema(), &Schema::Legacy);
        assert_eq!(table.len(), 3);

        let first = table.record(0).unwrap();
        assert_eq!(first.shift, Vector2::new(1.5, -2.0));
        assert_eq!(first.ctf.voltage, 300_000.0);
        assert_eq!(first.ctf.spherical_aberration, 2.7e7);
        assert_eq!(first.ctf.phase_shift, 0.0);
        assert_eq!(first.ctf.pixel_size, 1.34);
        assert!((first.ctf.astigmatism - 30f64.to_radians()).abs() < 1e-12);

        assert_eq!(table.half_sets(), &[1, 2, 1]);
        assert_eq!(table.image(1).unwrap().slice, 1);
        assert_eq!(
            table.stack_path(2).unwrap(),
            PathBuf::from("/data/stack.mrcs")
        );
    }

    #[test]
    fn legacy_file_without_pixel_size_is_a_schema_error() {
        let err = read(LEGACY_STAR, None).unwrap_err();
        assert!(matches!(
            err,
            StarError::Schema {
                kind: SchemaErrorKind::MissingPixelSize,
                ..
            }
        ));
    }

    #[test]
    fn missing_required_key_is_reported_by_name() {
        let content = LEGACY_STAR.replace("_rlnDefocusV #8", "_rlnCtfMaxResolution #8");
        let err = read(&content, Some(1.0)).unwrap_err();
        assert!(matches!(
            err,
            StarError::MissingKey {
                key: "rlnDefocusV",
                ..
            }
        ));
    }

    #[test]
    fn missing_random_subset_defaults_every_particle_to_half_set_one() {
        let content = LEGACY_STAR
            .replace("_rlnRandomSubset #13\n", "")
            .replace("stack.mrcs  1\n", "stack.mrcs\n")
            .replace("stack.mrcs  2\n", "stack.mrcs\n");
        let table = read(&content, Some(1.0)).unwrap();
        assert_eq!(table.half_sets(), &[1, 1, 1]);
    }

    #[test]
    fn unknown_block_name_is_rejected() {
        let content = LEGACY_STAR.replace("data_images", "data_model_classes");
        let err = read(&content, Some(1.0)).unwrap_err();
        assert!(matches!(
            err,
            StarError::Schema {
                line: 3,
                kind: SchemaErrorKind::UnrecognisedBlock(_)
            }
        ));
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let content = LEGACY_STAR.replace("_rlnRandomSubset #13", "_rlnOriginX #13");
        let err = read(&content, Some(1.0)).unwrap_err();
        assert!(matches!(
            err,
            StarError::Schema {
                kind: SchemaErrorKind::DuplicateKey(_),
                ..
            }
        ));
    }

    #[test]
    fn short_row_is_rejected_with_its_line_number() {
        let content = LEGACY_STAR.replace("000002@stack.mrcs  2", "");
        let err = read(&content, Some(1.0)).unwrap_err();
        assert!(matches!(
            err,
            StarError::Schema {
                line: 20,
                kind: SchemaErrorKind::ShortRow { .. }
            }
        ));
    }

    #[test]
    fn key_value_pairs_before_a_loop_are_rejected() {
        let content = LEGACY_STAR.replace("data_images\n", "data_images\n_rlnFoo 1\n");
        let err = read(&content, Some(1.0)).unwrap_err();
        assert!(matches!(
            err,
            StarError::Schema {
                line: 6,
                kind: SchemaErrorKind::UnexpectedLine(ref l),
            } if l == "loop_"
        ));
    }

    #[test]
    fn second_loop_in_one_block_is_rejected() {
        let content = LEGACY_STAR.replace("_rlnRandomSubset #13\n", "_rlnRandomSubset #13\nloop_\n");
        let err = read(&content, Some(1.0)).unwrap_err();
        assert!(matches!(
            err,
            StarError::Schema {
                kind: SchemaErrorKind::UnexpectedLine(_),
                ..
            }
        ));
    }

    #[test]
    fn joined_file_resolves_optics_per_particle() {
        let table = read(JOINED_STAR, None).unwrap();
        let Schema::Joined { optics } = table.schema() else {
            panic!("expected joined schema");
        };
        assert_eq!(optics.len(), 2);

        let first = table.record(0).unwrap();
        assert_eq!(first.shift, Vector2::new(2.0, -1.0));
        assert_eq!(first.ctf.pixel_size, 2.0);
        assert_eq!(first.ctf.voltage, 300_000.0);
        assert!((first.ctf.phase_shift - std::f64::consts::FRAC_PI_2).abs() < 1e-12);

        let second = table.record(1).unwrap();
        assert_eq!(second.ctf.pixel_size, 1.0);
        assert_eq!(second.ctf.voltage, 200_000.0);
        assert_eq!(second.ctf.amplitude_contrast, 0.07);
        assert_eq!(table.half_sets(), &[1, 2]);
    }

    #[test]
    fn undefined_optics_group_is_a_join_error() {
        let content = JOINED_STAR.replace("9500 10.0 2 2", "9500 10.0 3 2");
        let err = read(&content, None).unwrap_err();
        assert!(matches!(
            err,
            StarError::Join {
                group: 3,
                reason: JoinFailure::Undefined,
                ..
            }
        ));
    }

    #[test]
    fn duplicated_optics_group_is_a_join_error() {
        let content = JOINED_STAR.replace("opticsGroup2 2 200.0", "opticsGroup2 1 200.0");
        let err = read(&content, None).unwrap_err();
        assert!(matches!(
            err,
            StarError::Join {
                group: 1,
                reason: JoinFailure::Ambiguous(2),
                ..
            }
        ));
    }

    #[test]
    fn particles_without_optics_block_is_rejected() {
        let start = JOINED_STAR.find("# version 30001\n\ndata_particles").unwrap();
        let err = read(&JOINED_STAR[start..], None).unwrap_err();
        assert!(matches!(
            err,
            StarError::Schema {
                kind: SchemaErrorKind::UnpairedBlock(_, "optics"),
                ..
            }
        ));
    }

    #[test]
    fn missing_input_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = StarFile::load(&dir.path().join("absent.star"), dir.path(), None).unwrap_err();
        assert!(matches!(err, StarError::NotFound { .. }));
    }

    #[test]
    fn saving_an_unaltered_table_reproduces_the_input() {
        for (content, pixel_size) in [(LEGACY_STAR, Some(1.0)), (JOINED_STAR, None)] {
            let dir = TempDir::new().unwrap();
            let input = dir.path().join("in.star");
            let output = dir.path().join("out.star");
            fs::write(&input, content).unwrap();

            let table = StarFile::load(&input, dir.path(), pixel_size).unwrap();
            StarFile::save(&ParticleSet::new(table), &output).unwrap();

            assert_eq!(fs::read_to_string(&output).unwrap(), content);
        }
    }

    #[test]
    fn saving_a_subset_drops_only_excluded_rows_in_file_order() {
        let table = read(LEGACY_STAR, Some(1.0)).unwrap();
        let set = ParticleSet::new(table);
        let subset = set.select(&[2, 0]);

        let mut out = Vec::new();
        StarFile::write_to(&subset, &mut out).unwrap();
        let written = String::from_utf8(out).unwrap();

        assert!(written.contains("000001@stack.mrcs"));
        assert!(!written.contains("000002@stack.mrcs"));
        assert!(
            written.find("000001@stack.mrcs").unwrap() < written.find("000003@stack.mrcs").unwrap()
        );
        assert!(written.starts_with("# RELION; version 30000\n\ndata_images\n"));
    }
}
