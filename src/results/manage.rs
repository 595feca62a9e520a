// Housekeeping of folders and archives under the remote directory

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::config::PathsConfig;
use crate::remote::{shell, RemoteChannel};
use crate::types::{StageError, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveAction {
    Pack,
    Unpack,
    Delete,
}

impl fmt::Display for ArchiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveAction::Pack => "packed",
            ArchiveAction::Unpack => "unpacked",
            ArchiveAction::Delete => "deleted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveChange {
    pub action: ArchiveAction,
    /// Remote path after the change; the removed path for a delete
    pub path: String,
}

/// Packs, unpacks and deletes folders under the remote root. Without a
/// name, pack and unpack act on the temp directory.
pub struct ArchiveManager {
    channel: Arc<dyn RemoteChannel>,
    paths: PathsConfig,
}

impl ArchiveManager {
    pub fn new(channel: Arc<dyn RemoteChannel>, paths: &PathsConfig) -> Self {
        Self {
            channel,
            paths: paths.clone(),
        }
    }

    /// `<dir>` becomes `<dir>.tar.gz`
    pub async fn pack(&self, name: Option<&str>) -> StageResult<ArchiveChange> {
        let dir = self.target(name)?;
        if !self.channel.exec(&shell::test_dir(&dir)).await?.success() {
            return Err(StageError::RemoteState(format!("{dir} is not a directory")));
        }
        self.channel.exec(&shell::gzip_dir(&dir)).await?.require_success()?;

        let tarball = format!("{dir}.tar.gz");
        info!(archive = %tarball, "Directory packed");
        Ok(ArchiveChange {
            action: ArchiveAction::Pack,
            path: tarball,
        })
    }

    /// `<dir>.tar.gz` becomes `<dir>`
    pub async fn unpack(&self, name: Option<&str>) -> StageResult<ArchiveChange> {
        let dir = self.target(name)?;
        let tarball = format!("{dir}.tar.gz");
        if !self.channel.exec(&shell::test_file(&tarball)).await?.success() {
            return Err(StageError::RemoteState(format!("{tarball} does not exist")));
        }
        self.channel.exec(&shell::gunzip_dir(&dir)).await?.require_success()?;

        info!(dir = %dir, "Archive unpacked");
        Ok(ArchiveChange {
            action: ArchiveAction::Unpack,
            path: dir,
        })
    }

    /// Remove a file or folder given relative to the remote root
    pub async fn delete(&self, name: &str) -> StageResult<ArchiveChange> {
        let path = self.target(Some(name))?;
        if !self.channel.exec(&shell::test_exists(&path)).await?.success() {
            return Err(StageError::RemoteState(format!("{path} does not exist")));
        }
        self.channel.exec(&shell::remove_path(&path)).await?.require_success()?;

        info!(path = %path, "Remote path deleted");
        Ok(ArchiveChange {
            action: ArchiveAction::Delete,
            path,
        })
    }

    fn target(&self, name: Option<&str>) -> StageResult<String> {
        let Some(name) = name else {
            return Ok(self.paths.remote_temp_dir());
        };
        let name = name.trim().trim_end_matches('/');
        let name = name.strip_suffix(".tar.gz").unwrap_or(name);
        let escapes = name
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
        if name.is_empty() || name.starts_with('/') || escapes {
            return Err(StageError::Config(format!(
                "`{name}` is not a path under {}",
                self.paths.remote_root()
            )));
        }
        Ok(shell::join(&self.paths.remote_root(), name))
    }
}
