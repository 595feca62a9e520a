// Core models shared by every stage of a batch

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::jobs::naming;
use crate::remote::shell;

/// One row of the molecule list after ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoleculeRecord {
    /// Clean, charge-suffixed name; also the job directory name
    pub identifier: String,
    /// Structure descriptor as read from the list (SMILES)
    pub descriptor: String,
    pub formal_charge: i32,
}

/// Which submission script a job receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptVariant {
    /// Single-point calculation on the embedded geometry
    #[default]
    Standard,
    /// Geometry optimization before the property calculation
    Optimize,
}

impl fmt::Display for ScriptVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptVariant::Standard => write!(f, "standard"),
            ScriptVariant::Optimize => write!(f, "optimize"),
        }
    }
}

/// Conformer group of a job: the name without charge suffix and rank
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub base: String,
    pub rank: Option<u32>,
}

/// A unit of remote work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub local_dir: PathBuf,
    pub remote_dir: String,
    pub variant: ScriptVariant,
    pub group: GroupKey,
    pub charge: i32,
}

impl Job {
    /// Build a job whose directories are `<local_root>/<name>` and `<remote_root>/<name>`
    pub fn new(name: &str, local_root: impl Into<PathBuf>, remote_root: &str) -> Self {
        Self {
            name: name.to_string(),
            local_dir: local_root.into().join(name),
            remote_dir: shell::join(remote_root, name),
            variant: ScriptVariant::Standard,
            group: naming::parse_group_key(name),
            charge: naming::parse_charge(name),
        }
    }

    pub fn with_variant(mut self, variant: ScriptVariant) -> Self {
        self.variant = variant;
        self
    }
}

/// Scheduler state of a still-listed job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Held,
    /// Any token the scheduler reports that has no dedicated variant
    Other(String),
}

impl JobState {
    pub fn from_token(token: &str) -> Self {
        match token {
            "qw" | "q" | "Q" | "w" | "W" => JobState::Queued,
            "r" | "R" | "t" | "Rr" | "Rt" => JobState::Running,
            t if t.starts_with('h') || t.starts_with('H') => JobState::Held,
            other => JobState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Held => write!(f, "held"),
            JobState::Other(token) => write!(f, "{token}"),
        }
    }
}

/// A timestamped result folder on the remote root, possibly gzipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    /// Folder name without the `.tar.gz` extension
    pub name: String,
    /// Remote path of the folder (without `.tar.gz`)
    pub path: String,
    pub compressed: bool,
    pub timestamp: Option<NaiveDateTime>,
}

impl Archive {
    pub fn tarball(&self) -> String {
        format!("{}.tar.gz", self.path)
    }
}
