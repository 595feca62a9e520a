//! Job set construction.
//!
//! Turns a molecule list into one local working directory per job, each
//! holding a coordinate file:
//!
//! ```text
//! list.tsv ──read_molecule_list──▶ [(SMILES, display name)]
//!                                        │
//!                      smiles::parse ─▶ GeometryBuilder::embed (seeded)
//!                                        │
//!                             <out>/<clean_name>/x
//! ```

pub mod coord;
pub mod embed;
pub mod naming;
pub mod smiles;

pub use embed::{Atom, GeometryBuilder, SpringEmbedder};
pub use naming::{clean_name, parse_charge, parse_group_key};

use csv::ReaderBuilder;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::BuildConfig;
use crate::models::{Job, MoleculeRecord};
use crate::types::{StageError, StageResult};

/// One usable row of the molecule list
#[derive(Debug, Clone, PartialEq)]
pub struct MoleculeEntry {
    pub descriptor: String,
    pub display_name: String,
}

/// Read a tab-separated list without header: column 0 is the structure
/// descriptor, column 1 the display name. Short rows are skipped.
pub fn read_molecule_list(path: &Path) -> StageResult<Vec<MoleculeEntry>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| StageError::Parse(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut entries = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| StageError::Parse(format!("{}: {}", path.display(), e)))?;
        match (record.get(0), record.get(1)) {
            (Some(descriptor), Some(name)) if !descriptor.trim().is_empty() => {
                entries.push(MoleculeEntry {
                    descriptor: descriptor.trim().to_string(),
                    display_name: name.trim().to_string(),
                });
            }
            _ => warn!(line = line + 1, path = %path.display(), "Skipping malformed molecule list row"),
        }
    }
    Ok(entries)
}

/// Builds the local job tree from a molecule list
pub struct JobSetBuilder {
    geometry: Box<dyn GeometryBuilder>,
    seed: u64,
}

impl JobSetBuilder {
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            geometry: Box::new(SpringEmbedder::new(config.relax_iterations)),
            seed: config.seed,
        }
    }

    pub fn with_geometry(mut self, geometry: Box<dyn GeometryBuilder>) -> Self {
        self.geometry = geometry;
        self
    }

    /// Write `<out_dir>/<name>/x` for every usable entry and return the
    /// job names in input order. Anything already in `out_dir` is removed
    /// first.
    pub fn build(&self, entries: &[MoleculeEntry], out_dir: &Path) -> StageResult<Vec<String>> {
        Ok(self
            .build_records(entries, out_dir)?
            .into_iter()
            .map(|record| record.identifier)
            .collect())
    }

    pub fn build_records(
        &self,
        entries: &[MoleculeEntry],
        out_dir: &Path,
    ) -> StageResult<Vec<MoleculeRecord>> {
        if entries.is_empty() {
            return Err(StageError::EmptyInput("molecule list is empty".to_string()));
        }
        if out_dir.exists() {
            debug!(dir = %out_dir.display(), "Removing previous job tree");
            std::fs::remove_dir_all(out_dir)?;
        }
        std::fs::create_dir_all(out_dir)?;

        let mut taken = HashSet::new();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.build_one(entry, out_dir, &mut taken) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    name = %entry.display_name,
                    descriptor = %entry.descriptor,
                    error = %e,
                    "Skipping molecule"
                ),
            }
        }

        info!(
            built = records.len(),
            skipped = entries.len() - records.len(),
            out_dir = %out_dir.display(),
            "Job set built"
        );
        Ok(records)
    }

    fn build_one(
        &self,
        entry: &MoleculeEntry,
        out_dir: &Path,
        taken: &mut HashSet<String>,
    ) -> StageResult<MoleculeRecord> {
        let structure = smiles::parse(&entry.descriptor)?;
        let charge = structure.formal_charge();

        let name = clean_name(&entry.display_name, charge);
        if name.is_empty() {
            return Err(StageError::Parse(format!(
                "display name '{}' has no usable characters",
                entry.display_name
            )));
        }
        let name = unique_name(name, charge, taken);

        let atoms = self.geometry.embed(&structure, self.seed)?;
        coord::write_coord_file(&out_dir.join(&name), &atoms)?;
        taken.insert(name.clone());

        Ok(MoleculeRecord {
            identifier: name,
            descriptor: entry.descriptor.clone(),
            formal_charge: charge,
        })
    }
}

/// Disambiguate a repeated name with `_2`, `_3`, … ahead of the charge suffix
fn unique_name(name: String, charge: i32, taken: &HashSet<String>) -> String {
    if !taken.contains(&name) {
        return name;
    }
    let suffix = naming::charge_suffix(charge);
    let stem = name
        .strip_suffix(suffix.as_str())
        .unwrap_or(&name)
        .to_string();
    (2..)
        .map(|n| format!("{stem}_{n}{suffix}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(name)
}

/// Jobs for the directories under `local_root`, mapped onto `remote_root`
pub fn jobs_from_names(names: &[String], local_root: &Path, remote_root: &str) -> Vec<Job> {
    names
        .iter()
        .map(|name| Job::new(name, local_root, remote_root))
        .collect()
}

/// Job names recovered from an existing job tree (sorted)
pub fn discover_job_names(local_root: &Path) -> StageResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(local_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.path().join(coord::COORD_FILE_NAME).is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn entry(descriptor: &str, name: &str) -> MoleculeEntry {
        MoleculeEntry {
            descriptor: descriptor.to_string(),
            display_name: name.to_string(),
        }
    }

    #[test]
    fn test_read_molecule_list_skips_short_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("PFOA.tsv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "OC(=O)C(F)(F)F\tTFA").unwrap();
        writeln!(file, "lonely").unwrap();
        writeln!(file, "[O-]C(=O)C\tacetate").unwrap();

        let entries = read_molecule_list(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], entry("[O-]C(=O)C", "acetate"));
    }

    #[test]
    fn test_build_writes_one_directory_per_job() {
        let temp_dir = TempDir::new().unwrap();
        let builder = JobSetBuilder::new(&BuildConfig::default());
        let names = builder
            .build(
                &[
                    entry("[O-]C(=O)C", "acetate"),
                    entry("not a smiles", "broken"),
                    entry("CCO", "2-ethanol"),
                    entry("CCO", "2-ethanol"),
                ],
                temp_dir.path(),
            )
            .unwrap();

        assert_eq!(names, vec!["acetate_neg1", "m2-ethanol", "m2-ethanol_2"]);
        let coord = std::fs::read_to_string(temp_dir.path().join("acetate_neg1/x")).unwrap();
        assert!(coord.starts_with("7\n\n"));
        assert!(!temp_dir.path().join("broken").exists());
        assert_eq!(discover_job_names(temp_dir.path()).unwrap().len(), 3);
    }

    #[test]
    fn test_build_is_reproducible() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let builder = JobSetBuilder::new(&BuildConfig::default());
        let entries = [entry("c1ccccc1O", "phenol")];
        builder.build(&entries, first.path()).unwrap();
        builder.build(&entries, second.path()).unwrap();
        assert_eq!(
            std::fs::read(first.path().join("phenol/x")).unwrap(),
            std::fs::read(second.path().join("phenol/x")).unwrap()
        );
    }

    #[test]
    fn test_rebuild_replaces_the_previous_tree() {
        let temp_dir = TempDir::new().unwrap();
        let out_dir = temp_dir.path().join("COORD_files");
        let builder = JobSetBuilder::new(&BuildConfig::default());
        builder
            .build(&[entry("CCO", "ethanol"), entry("O", "water")], &out_dir)
            .unwrap();
        let names = builder.build(&[entry("C", "methane")], &out_dir).unwrap();

        assert_eq!(names, vec!["methane"]);
        assert_eq!(discover_job_names(&out_dir).unwrap(), vec!["methane"]);
        assert!(!out_dir.join("ethanol").exists());
        assert!(!out_dir.join("water").exists());
    }

    #[test]
    fn test_empty_list_fails() {
        let temp_dir = TempDir::new().unwrap();
        let builder = JobSetBuilder::new(&BuildConfig::default());
        assert!(matches!(
            builder.build(&[], temp_dir.path()),
            Err(StageError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_unique_name_keeps_charge_suffix_last() {
        let taken: HashSet<String> = ["PFOA_neg1".to_string()].into_iter().collect();
        assert_eq!(unique_name("PFOA_neg1".to_string(), -1, &taken), "PFOA_2_neg1");
    }
}
