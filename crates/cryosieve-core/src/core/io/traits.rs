use crate::core::models::set::ParticleSet;
use crate::core::models::table::ParticleTable;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Defines the interface for reading and writing particle metadata formats.
///
/// Implementors parse a complete [`ParticleTable`] from text and serialize a
/// filtered [`ParticleSet`] back in the schema the table was read in.
pub trait ParticleFile {
    /// Options controlling how raw fields are resolved into particle records.
    type Options;

    /// The error type for I/O operations.
    type Error: Error + From<io::Error>;

    /// Reads a particle table from a buffered reader.
    ///
    /// # Arguments
    ///
    /// * `reader` - The buffered reader to read from.
    /// * `options` - Resolution options such as the particle directory.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails or I/O operations encounter issues.
    fn read_from(
        reader: &mut impl BufRead,
        options: &Self::Options,
    ) -> Result<ParticleTable, Self::Error>;

    /// Writes the rows of a particle view to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_to(set: &ParticleSet, writer: &mut impl Write) -> Result<(), Self::Error>;

    /// Reads a particle table from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or parsing fails.
    fn read_from_path<P: AsRef<Path>>(
        path: P,
        options: &Self::Options,
    ) -> Result<ParticleTable, Self::Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader, options)
    }

    /// Writes the rows of a particle view to a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or writing fails.
    fn write_to_path<P: AsRef<Path>>(set: &ParticleSet, path: P) -> Result<(), Self::Error> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        Self::write_to(set, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
