use crate::cli::InspectArgs;
use crate::error::Result;
use cryosieve::core::io::star::StarFile;
use cryosieve::core::models::table::{ParticleTable, Schema};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::info;

pub fn run(args: InspectArgs) -> Result<()> {
    let data_dir = args.directory.clone().unwrap_or_default();
    info!("Loading particle metadata from {:?}", &args.input);
    let table = StarFile::load(&args.input, &data_dir, args.angpix)?;
    print!("{}", summarize(&table));
    Ok(())
}

/// Formats the schema, optics groups, half-set sizes and stack count of a table.
pub fn summarize(table: &ParticleTable) -> String {
    let mut out = format!(
        "Schema:     {}\nParticles:  {}\n",
        table.schema().name(),
        table.len()
    );

    if let Schema::Joined { optics } = table.schema() {
        out.push_str("Optics groups:\n");
        for group in optics {
            out.push_str(&format!(
                "  {:>3}: {:.1} kV, {:.4} Å/px, Cs {:.2} mm, amplitude contrast {:.3}\n",
                group.id,
                group.voltage,
                group.pixel_size,
                group.spherical_aberration,
                group.amplitude_contrast
            ));
        }
    }

    out.push_str("Half-sets:\n");
    for (id, size) in table.half_set_sizes() {
        out.push_str(&format!("  {:>3}: {} particles\n", id, size));
    }

    let stacks: BTreeSet<PathBuf> = (0..table.len())
        .filter_map(|row| table.stack_path(row))
        .collect();
    out.push_str(&format!("Image stacks: {}\n", stacks.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const JOINED: &str = "\
data_optics

loop_
_rlnOpticsGroup #1
_rlnVoltage #2
_rlnImagePixelSize #3
_rlnSphericalAberration #4
_rlnAmplitudeContrast #5
1 300.0 1.06 2.7 0.1

data_particles

loop_
_rlnOriginXAngst #1
_rlnOriginYAngst #2
_rlnAngleRot #3
_rlnAngleTilt #4
_rlnAnglePsi #5
_rlnDefocusU #6
_rlnDefocusV #7
_rlnDefocusAngle #8
_rlnImageName #9
_rlnOpticsGroup #10
_rlnRandomSubset #11
0.0 0.0 10 20 30 15000 14000 5 1@a.mrcs 1 1
1.06 0.0 10 20 30 15000 14000 5 2@a.mrcs 1 2
0.0 1.06 10 20 30 15000 14000 5 1@b.mrcs 1 2
";

    #[test]
    fn summary_lists_optics_half_sets_and_stacks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("particles.star");
        fs::write(&path, JOINED).unwrap();

        let table = StarFile::load(&path, Path::new(""), None).unwrap();
        let summary = summarize(&table);

        assert!(summary.contains("Schema:     optics-joined"));
        assert!(summary.contains("Particles:  3"));
        assert!(summary.contains("300.0 kV, 1.0600 Å/px, Cs 2.70 mm"));
        assert!(summary.contains("    1: 1 particles"));
        assert!(summary.contains("    2: 2 particles"));
        assert!(summary.contains("Image stacks: 2"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let args = InspectArgs {
            input: PathBuf::from("/definitely/not/here.star"),
            angpix: None,
            directory: None,
        };
        assert!(run(args).is_err());
    }
}
