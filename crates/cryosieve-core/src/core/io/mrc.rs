use half::f16;
use ndarray::{Array2, Array3};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Size of the fixed MRC header in bytes.
pub const HEADER_SIZE: usize = 1024;

const MAP_TAG: &[u8; 4] = b"MAP ";

#[derive(Debug, Error)]
pub enum MrcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid MRC file '{}': {reason}", path.display())]
    Format { path: PathBuf, reason: FormatError },
    #[error("Image index {index} is out of range for a stack of {count} images")]
    SliceOutOfRange { index: usize, count: usize },
    #[error("Mask shape {mask:?} does not match volume shape {volume:?}")]
    ShapeMismatch {
        volume: [usize; 3],
        mask: [usize; 3],
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("header is shorter than {} bytes", HEADER_SIZE)]
    TruncatedHeader,
    #[error("unsupported data mode {0}")]
    UnsupportedMode(i32),
    #[error("non-positive dimensions {0}x{1}x{2}")]
    InvalidDimensions(i32, i32, i32),
    #[error("dimensions {0}x{1}x{2} exceed the addressable size")]
    TooLarge(usize, usize, usize),
    #[error("data section ends after {found} of {expected} bytes")]
    TruncatedData { expected: usize, found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Decodes the machine stamp. Unknown stamps fall back to little endian.
    fn from_stamp(stamp: u8) -> Self {
        match stamp {
            0x11 => Endianness::Big,
            _ => Endianness::Little,
        }
    }

    fn i32_at(self, bytes: &[u8], offset: usize) -> i32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[offset..offset + 4]);
        match self {
            Endianness::Little => i32::from_le_bytes(word),
            Endianness::Big => i32::from_be_bytes(word),
        }
    }

    fn f32_at(self, bytes: &[u8], offset: usize) -> f32 {
        f32::from_bits(self.i32_at(bytes, offset) as u32)
    }
}

/// Voxel encodings supported by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Int8,
    Int16,
    Float32,
    UInt16,
    Float16,
}

impl Mode {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Mode::Int8),
            1 => Some(Mode::Int16),
            2 => Some(Mode::Float32),
            6 => Some(Mode::UInt16),
            12 => Some(Mode::Float16),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Mode::Int8 => 0,
            Mode::Int16 => 1,
            Mode::Float32 => 2,
            Mode::UInt16 => 6,
            Mode::Float16 => 12,
        }
    }

    pub fn bytes_per_voxel(self) -> usize {
        match self {
            Mode::Int8 => 1,
            Mode::Int16 | Mode::UInt16 | Mode::Float16 => 2,
            Mode::Float32 => 4,
        }
    }

    fn decode(self, chunk: &[u8], endianness: Endianness) -> f64 {
        let pair = || [chunk[0], chunk[1]];
        match (self, endianness) {
            (Mode::Int8, _) => chunk[0] as i8 as f64,
            (Mode::Int16, Endianness::Little) => i16::from_le_bytes(pair()) as f64,
            (Mode::Int16, Endianness::Big) => i16::from_be_bytes(pair()) as f64,
            (Mode::UInt16, Endianness::Little) => u16::from_le_bytes(pair()) as f64,
            (Mode::UInt16, Endianness::Big) => u16::from_be_bytes(pair()) as f64,
            (Mode::Float16, Endianness::Little) => f16::from_le_bytes(pair()).to_f64(),
            (Mode::Float16, Endianness::Big) => f16::from_be_bytes(pair()).to_f64(),
            (Mode::Float32, Endianness::Little) => {
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
            (Mode::Float32, Endianness::Big) => {
                f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
        }
    }
}

/// The subset of the MRC header the loader relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct MrcHeader {
    /// Columns, rows and sections, fastest-varying first.
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub mode: Mode,
    pub endianness: Endianness,
    /// Whether the `MAP ` identification tag was present.
    pub has_map_tag: bool,
    sampling_x: i32,
    cell_x: f32,
    extended_header: usize,
    section_bytes: usize,
    data_bytes: usize,
}

impl MrcHeader {
    fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, FormatError> {
        let endianness = Endianness::from_stamp(bytes[212]);
        let (nx, ny, nz) = (
            endianness.i32_at(bytes, 0),
            endianness.i32_at(bytes, 4),
            endianness.i32_at(bytes, 8),
        );
        if nx <= 0 || ny <= 0 || nz <= 0 {
            return Err(FormatError::InvalidDimensions(nx, ny, nz));
        }
        let code = endianness.i32_at(bytes, 12);
        let mode = Mode::from_code(code).ok_or(FormatError::UnsupportedMode(code))?;
        let nsymbt = endianness.i32_at(bytes, 92);

        let (nx, ny, nz) = (nx as usize, ny as usize, nz as usize);
        let too_large = || FormatError::TooLarge(nx, ny, nz);
        let section_bytes = nx
            .checked_mul(ny)
            .and_then(|n| n.checked_mul(mode.bytes_per_voxel()))
            .ok_or_else(too_large)?;
        let data_bytes = section_bytes.checked_mul(nz).ok_or_else(too_large)?;

        Ok(Self {
            nx,
            ny,
            nz,
            mode,
            endianness,
            has_map_tag: &bytes[208..212] == MAP_TAG,
            sampling_x: endianness.i32_at(bytes, 28),
            cell_x: endianness.f32_at(bytes, 40),
            extended_header: nsymbt.max(0) as usize,
            section_bytes,
            data_bytes,
        })
    }

    /// Pixel size in Angstroms derived from the unit cell, if the header defines one.
    pub fn pixel_size(&self) -> Option<f64> {
        (self.sampling_x > 0 && self.cell_x > 0.0)
            .then(|| self.cell_x as f64 / self.sampling_x as f64)
    }

    /// Byte offset of the first voxel.
    pub fn data_offset(&self) -> u64 {
        (HEADER_SIZE + self.extended_header) as u64
    }

    /// Size of the voxel data in bytes, excluding both headers.
    pub fn data_len(&self) -> usize {
        self.data_bytes
    }
}

/// An open MRC file that serves individual sections on demand.
///
/// Loader threads keep one of these per stack so the header is parsed once
/// no matter how many particles share the file.
pub struct MrcStack {
    path: PathBuf,
    header: MrcHeader,
    reader: BufReader<File>,
}

impl MrcStack {
    pub fn open(path: &Path) -> Result<Self, MrcError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => format_error(path, FormatError::TruncatedHeader),
            _ => MrcError::Io(e),
        })?;
        let header = MrcHeader::parse(&bytes).map_err(|reason| format_error(path, reason))?;
        let available = reader
            .get_ref()
            .metadata()?
            .len()
            .saturating_sub(header.data_offset());
        if available < header.data_bytes as u64 {
            return Err(format_error(
                path,
                FormatError::TruncatedData {
                    expected: header.data_bytes,
                    found: available as usize,
                },
            ));
        }
        if !header.has_map_tag {
            debug!(path = %path.display(), "MRC file has no MAP tag; reading anyway.");
        }
        Ok(Self {
            path: path.to_path_buf(),
            header,
            reader,
        })
    }

    pub fn header(&self) -> &MrcHeader {
        &self.header
    }

    /// Number of images in the stack.
    pub fn len(&self) -> usize {
        self.header.nz
    }

    pub fn is_empty(&self) -> bool {
        self.header.nz == 0
    }

    /// Reads one image of the stack.
    ///
    /// A file holding a single section returns that section for any index.
    pub fn read_image(&mut self, index: usize) -> Result<Array2<f64>, MrcError> {
        let section = match self.header.nz {
            1 => 0,
            count if index < count => index,
            count => return Err(MrcError::SliceOutOfRange { index, count }),
        };
        let offset = self.header.data_offset() + (section * self.header.section_bytes) as u64;
        self.reader.seek(SeekFrom::Start(offset))?;
        let values = self.read_voxels(self.header.section_bytes)?;
        Ok(Array2::from_shape_vec((self.header.ny, self.header.nx), values)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?)
    }

    /// Reads every section as a `(z, y, x)` array.
    pub fn read_all(&mut self) -> Result<Array3<f64>, MrcError> {
        let header = &self.header;
        let shape = (header.nz, header.ny, header.nx);
        let data_bytes = header.data_bytes;
        self.reader.seek(SeekFrom::Start(header.data_offset()))?;
        let values = self.read_voxels(data_bytes)?;
        Ok(Array3::from_shape_vec(shape, values)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?)
    }

    fn read_voxels(&mut self, expected: usize) -> Result<Vec<f64>, MrcError> {
        let width = self.header.mode.bytes_per_voxel();
        let mut raw = Vec::with_capacity(expected);
        (&mut self.reader)
            .take(expected as u64)
            .read_to_end(&mut raw)?;
        if raw.len() < expected {
            return Err(format_error(
                &self.path,
                FormatError::TruncatedData {
                    expected,
                    found: raw.len(),
                },
            ));
        }
        let (mode, endianness) = (self.header.mode, self.header.endianness);
        Ok(raw
            .chunks_exact(width)
            .map(|chunk| mode.decode(chunk, endianness))
            .collect())
    }
}

fn format_error(path: &Path, reason: FormatError) -> MrcError {
    MrcError::Format {
        path: path.to_path_buf(),
        reason,
    }
}

pub fn read_header(path: &Path) -> Result<MrcHeader, MrcError> {
    Ok(MrcStack::open(path)?.header)
}

/// Reads a density map as a `(z, y, x)` array.
pub fn read_volume(path: &Path) -> Result<Array3<f64>, MrcError> {
    let mut stack = MrcStack::open(path)?;
    let volume = stack.read_all()?;
    debug!(path = %path.display(), shape = ?volume.shape(), "Loaded MRC volume.");
    Ok(volume)
}

/// Reads a 2D or 3D mask. A 2D mask is returned with a single section.
pub fn read_mask(path: &Path) -> Result<Array3<f64>, MrcError> {
    read_volume(path)
}

/// Reads image `index` (zero-based) of an image stack.
pub fn read_image(path: &Path, index: usize) -> Result<Array2<f64>, MrcError> {
    MrcStack::open(path)?.read_image(index)
}

/// Multiplies a volume by a mask of identical shape.
pub fn apply_mask(volume: &Array3<f64>, mask: &Array3<f64>) -> Result<Array3<f64>, MrcError> {
    if volume.shape() != mask.shape() {
        return Err(MrcError::ShapeMismatch {
            volume: dims(volume),
            mask: dims(mask),
        });
    }
    Ok(volume * mask)
}

fn dims(array: &Array3<f64>) -> [usize; 3] {
    let (z, y, x) = array.dim();
    [z, y, x]
}

/// Writes a `(z, y, x)` array as a little-endian float32 MRC file.
pub fn write_volume(path: &Path, data: &Array3<f64>, pixel_size: f64) -> Result<(), MrcError> {
    let (nz, ny, nx) = data.dim();
    let mut header = [0u8; HEADER_SIZE];
    let mut put = |offset: usize, bytes: [u8; 4]| header[offset..offset + 4].copy_from_slice(&bytes);

    put(0, (nx as i32).to_le_bytes());
    put(4, (ny as i32).to_le_bytes());
    put(8, (nz as i32).to_le_bytes());
    put(12, Mode::Float32.code().to_le_bytes());
    put(28, (nx as i32).to_le_bytes());
    put(32, (ny as i32).to_le_bytes());
    put(36, (nz as i32).to_le_bytes());
    put(40, ((nx as f64 * pixel_size) as f32).to_le_bytes());
    put(44, ((ny as f64 * pixel_size) as f32).to_le_bytes());
    put(48, ((nz as f64 * pixel_size) as f32).to_le_bytes());
    for offset in [52, 56, 60] {
        put(offset, 90f32.to_le_bytes());
    }
    put(64, 1i32.to_le_bytes());
    put(68, 2i32.to_le_bytes());
    put(72, 3i32.to_le_bytes());
    put(208, *MAP_TAG);
    put(212, [0x44, 0x44, 0x00, 0x00]);

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&header)?;
    for &value in data.iter() {
        writer.write_all(&(value as f32).to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes a list of equally sized images as an MRC image stack.
pub fn write_stack(path: &Path, images: &[Array2<f64>], pixel_size: f64) -> Result<(), MrcError> {
    let (ny, nx) = images.first().map_or((0, 0), Array2::dim);
    let mut stack = Array3::zeros((images.len(), ny, nx));
    for (mut section, image) in stack.outer_iter_mut().zip(images) {
        section.assign(image);
    }
    write_volume(path, &stack, pixel_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use std::fs;
    use tempfile::TempDir;

    fn ramp(shape: (usize, usize, usize)) -> Array3<f64> {
        Array::from_shape_fn(shape, |(z, y, x)| (z * 100 + y * 10 + x) as f64)
    }

    fn raw_header(nx: i32, ny: i32, nz: i32, mode: i32, stamp: u8) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_SIZE];
        let words = [nx, ny, nz, mode];
        for (i, word) in words.iter().enumerate() {
            let bytes = if stamp == 0x11 {
                word.to_be_bytes()
            } else {
                word.to_le_bytes()
            };
            header[i * 4..i * 4 + 4].copy_from_slice(&bytes);
        }
        header[212] = stamp;
        header
    }

    #[test]
    fn volume_round_trips_through_float32_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ramp.mrc");
        let volume = ramp((3, 4, 5));
        write_volume(&path, &volume, 1.5).unwrap();

        let read = read_volume(&path).unwrap();
        assert_eq!(read, volume);

        let header = read_header(&path).unwrap();
        assert_eq!((header.nx, header.ny, header.nz), (5, 4, 3));
        assert!(header.has_map_tag);
        assert!((header.pixel_size().unwrap() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn read_image_returns_the_requested_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.mrcs");
        write_volume(&path, &ramp((4, 3, 3)), 1.0).unwrap();

        let image = read_image(&path, 2).unwrap();
        assert_eq!(image.dim(), (3, 3));
        assert_eq!(image[[1, 2]], 212.0);
        assert!(matches!(
            read_image(&path, 4),
            Err(MrcError::SliceOutOfRange { index: 4, count: 4 })
        ));
    }

    #[test]
    fn single_section_file_serves_any_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("single.mrc");
        write_stack(&path, &[Array2::from_elem((2, 2), 7.0)], 1.0).unwrap();
        assert_eq!(read_image(&path, 9).unwrap(), Array2::from_elem((2, 2), 7.0));
    }

    #[test]
    fn big_endian_int16_data_is_decoded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("be.mrc");
        let mut bytes = raw_header(2, 1, 1, 1, 0x11);
        bytes.extend_from_slice(&(-3i16).to_be_bytes());
        bytes.extend_from_slice(&(500i16).to_be_bytes());
        fs::write(&path, bytes).unwrap();

        let volume = read_volume(&path).unwrap();
        assert_eq!(volume.iter().copied().collect::<Vec<_>>(), vec![-3.0, 500.0]);
        assert!(!read_header(&path).unwrap().has_map_tag);
    }

    #[test]
    fn negative_extended_header_size_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ext.mrc");
        let mut bytes = raw_header(1, 1, 1, 0, 0x00);
        bytes[92..96].copy_from_slice(&(-8i32).to_le_bytes());
        bytes.push(0xfe);
        fs::write(&path, bytes).unwrap();

        assert_eq!(read_volume(&path).unwrap()[[0, 0, 0]], -2.0);
    }

    #[test]
    fn corrupt_headers_are_format_errors() {
        let dir = TempDir::new().unwrap();

        let short = dir.path().join("short.mrc");
        fs::write(&short, [0u8; 100]).unwrap();
        assert!(matches!(
            read_volume(&short),
            Err(MrcError::Format {
                reason: FormatError::TruncatedHeader,
                ..
            })
        ));

        let mode = dir.path().join("mode.mrc");
        fs::write(&mode, raw_header(1, 1, 1, 3, 0x44)).unwrap();
        assert!(matches!(
            read_volume(&mode),
            Err(MrcError::Format {
                reason: FormatError::UnsupportedMode(3),
                ..
            })
        ));

        let dims = dir.path().join("dims.mrc");
        fs::write(&dims, raw_header(0, 4, 4, 2, 0x44)).unwrap();
        assert!(matches!(
            read_volume(&dims),
            Err(MrcError::Format {
                reason: FormatError::InvalidDimensions(0, 4, 4),
                ..
            })
        ));

        let truncated = dir.path().join("truncated.mrc");
        let mut bytes = raw_header(2, 2, 1, 2, 0x44);
        bytes.extend_from_slice(&[0u8; 6]);
        fs::write(&truncated, bytes).unwrap();
        assert!(matches!(
            read_volume(&truncated),
            Err(MrcError::Format {
                reason: FormatError::TruncatedData {
                    expected: 16,
                    found: 6
                },
                ..
            })
        ));
    }

    #[test]
    fn oversized_dimensions_are_format_errors() {
        let dir = TempDir::new().unwrap();

        let overflow = dir.path().join("overflow.mrc");
        let mut bytes = raw_header(3_000_000, 3_000_000, 3_000_000, 2, 0x44);
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&overflow, bytes).unwrap();
        assert!(matches!(
            read_volume(&overflow),
            Err(MrcError::Format {
                reason: FormatError::TooLarge(3_000_000, 3_000_000, 3_000_000),
                ..
            })
        ));

        let beyond_file = dir.path().join("beyond.mrc");
        let mut bytes = raw_header(100_000, 100_000, 1, 2, 0x44);
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&beyond_file, bytes).unwrap();
        assert!(matches!(
            read_image(&beyond_file, 0),
            Err(MrcError::Format {
                reason: FormatError::TruncatedData {
                    expected: 40_000_000_000,
                    found: 16
                },
                ..
            })
        ));
    }

    #[test]
    fn float16_data_is_decoded_in_both_byte_orders() {
        let dir = TempDir::new().unwrap();
        let values = [1.5f32, -0.25, 2048.0];

        for stamp in [0x44, 0x11] {
            let path = dir.path().join(format!("half_{stamp:x}.mrcs"));
            let mut bytes = raw_header(3, 1, 1, 12, stamp);
            for value in values {
                let value = f16::from_f32(value);
                if stamp == 0x11 {
                    bytes.extend_from_slice(&value.to_be_bytes());
                } else {
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
            }
            fs::write(&path, bytes).unwrap();

            assert_eq!(read_header(&path).unwrap().mode, Mode::Float16);
            let image = read_image(&path, 0).unwrap();
            assert_eq!(image.iter().copied().collect::<Vec<_>>(), vec![1.5, -0.25, 2048.0]);
        }
    }

    #[test]
    fn apply_mask_multiplies_and_checks_shape() {
        let volume = ramp((2, 2, 2));
        let mut mask = Array3::ones((2, 2, 2));
        mask[[1, 1, 1]] = 0.0;
        let masked = apply_mask(&volume, &mask).unwrap();
        assert_eq!(masked[[1, 1, 1]], 0.0);
        assert_eq!(masked[[1, 0, 1]], volume[[1, 0, 1]]);

        assert!(matches!(
            apply_mask(&volume, &Array3::ones((1, 2, 2))),
            Err(MrcError::ShapeMismatch { .. })
        ));
    }
}
