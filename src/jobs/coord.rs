// Coordinate file writer

use std::fmt::Write as _;
use std::path::Path;

use super::embed::Atom;
use crate::types::StageResult;

/// XYZ input inside each job directory. `tx` reads it and writes the
/// Turbomole `coord` file next to it.
pub const COORD_FILE_NAME: &str = "x";

/// Atom count, a blank line, then one fixed-width line per atom
pub fn format_coordinates(atoms: &[Atom]) -> String {
    let mut out = format!("{}\n\n", atoms.len());
    for atom in atoms {
        let p = atom.position;
        // writing to a String cannot fail
        let _ = writeln!(
            out,
            "{:<2} {:>12.5} {:>12.5} {:>12.5}",
            atom.element, p.x, p.y, p.z
        );
    }
    out
}

pub fn write_coord_file(job_dir: &Path, atoms: &[Atom]) -> StageResult<()> {
    std::fs::create_dir_all(job_dir)?;
    std::fs::write(job_dir.join(COORD_FILE_NAME), format_coordinates(atoms))?;
    Ok(())
}
