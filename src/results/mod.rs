//! Result Collector
//!
//! Pulls computed output files back from the cluster, either from the live
//! temp directory or from a timestamped archive folder.
//!
//! ```text
//!   locate source ─▶ gunzip? ─▶ clear local output ─▶ pull_selective ─▶ gzip again
//!                                                                        (always, if
//!                                                                         we unpacked)
//! ```
//!
//! A compressed archive unpacked for the pull is packed again before
//! `retrieve` returns, also when the pull itself failed. [`ArchiveManager`]
//! packs, unpacks and deletes archives by hand.

pub mod archive;
pub mod manage;

pub use archive::{latest_archive, locate_archive, parse_timestamp};
pub use manage::{ArchiveAction, ArchiveChange, ArchiveManager};

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{PathsConfig, RetrieveConfig};
use crate::models::Archive;
use crate::remote::{shell, RemoteChannel};
use crate::transfer::{FileFilter, TransferEngine, TransferReport};
use crate::types::{StageError, StageResult};

/// Where results are pulled from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrieveSource {
    /// The remote working directory of the current batch
    TempDir,
    /// A timestamped archive; the most recent one when no name is given
    Archive(Option<String>),
}

impl RetrieveSource {
    pub fn from_config(config: &RetrieveConfig) -> Self {
        if config.pull_from_timestamped_folder {
            RetrieveSource::Archive(config.timestamp_folder.clone())
        } else {
            RetrieveSource::TempDir
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveReport {
    /// Remote directory the files were pulled from
    pub source: String,
    pub archive: Option<Archive>,
    pub output_dir: PathBuf,
    pub transfers: TransferReport,
    /// The archive was unpacked for the pull and packed again afterwards
    pub recompressed: bool,
}

pub struct ResultCollector {
    channel: Arc<dyn RemoteChannel>,
    transfer: TransferEngine,
    paths: PathsConfig,
    config: RetrieveConfig,
    driver_script_name: String,
}

impl ResultCollector {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        transfer: TransferEngine,
        paths: &PathsConfig,
        config: &RetrieveConfig,
        driver_script_name: &str,
    ) -> Self {
        Self {
            channel,
            transfer,
            paths: paths.clone(),
            config: config.clone(),
            driver_script_name: driver_script_name.to_string(),
        }
    }

    pub fn output_dir(&self, local_root: &Path) -> PathBuf {
        local_root.join(&self.config.output_folder_name)
    }

    /// Pull the results of `source` into `<local_root>/<output folder>`,
    /// mirroring `<job>/<file>`
    pub async fn retrieve(&self, source: RetrieveSource, local_root: &Path) -> StageResult<RetrieveReport> {
        let (remote_dir, archive) = self.resolve(&source).await?;

        let unpacked = match &archive {
            Some(found) if found.compressed => {
                info!(archive = %found.tarball(), "Unpacking archive for retrieval");
                let result = self.channel.exec(&shell::gunzip_dir(&found.path)).await?;
                if !result.success() {
                    return Err(StageError::RemoteState(format!(
                        "cannot unpack {}: {}",
                        found.tarball(),
                        result.combined_output().trim()
                    )));
                }
                true
            }
            _ => false,
        };

        let output_dir = self.output_dir(local_root);
        let pulled = self.pull_into(&remote_dir, &output_dir).await;

        if unpacked {
            if let Err(e) = self.repack(&remote_dir).await {
                error!(remote = %remote_dir, error = %e, "Archive left uncompressed");
                return Err(pulled.err().unwrap_or(e));
            }
        }

        let transfers = pulled?;
        if !transfers.is_clean() {
            warn!(failed = transfers.failed().len(), "Some result files were not retrieved");
        }
        info!(
            source = %remote_dir,
            output = %output_dir.display(),
            summary = %transfers.summary(),
            "Results retrieved"
        );

        Ok(RetrieveReport {
            source: remote_dir,
            archive,
            output_dir,
            transfers,
            recompressed: unpacked,
        })
    }

    async fn resolve(&self, source: &RetrieveSource) -> StageResult<(String, Option<Archive>)> {
        match source {
            RetrieveSource::TempDir => {
                let dir = self.paths.remote_temp_dir();
                if !self.channel.exec(&shell::test_dir(&dir)).await?.success() {
                    return Err(StageError::RemoteState(format!("{dir} does not exist")));
                }
                Ok((dir, None))
            }
            RetrieveSource::Archive(name) => {
                let root = self.paths.remote_root();
                let found = locate_archive(&self.channel, &root, name.as_deref())
                    .await?
                    .ok_or_else(|| {
                        StageError::RemoteState(format!("no timestamped archive under {root}"))
                    })?;
                info!(archive = %found.name, compressed = found.compressed, "Using archive");
                Ok((found.path.clone(), Some(found)))
            }
        }
    }

    async fn pull_into(&self, remote_dir: &str, output_dir: &Path) -> StageResult<TransferReport> {
        if tokio::fs::try_exists(output_dir).await? {
            tokio::fs::remove_dir_all(output_dir).await?;
        }
        tokio::fs::create_dir_all(output_dir).await?;

        let filter = FileFilter::from_extension(self.config.only_extension.as_deref());
        self.transfer
            .pull_selective(
                remote_dir,
                output_dir,
                &filter,
                std::slice::from_ref(&self.driver_script_name),
            )
            .await
    }

    async fn repack(&self, dir: &str) -> StageResult<()> {
        let result = self.channel.exec(&shell::gzip_dir(dir)).await?;
        if !result.success() {
            return Err(StageError::RemoteState(format!(
                "cannot repack {dir}: {}",
                result.combined_output().trim()
            )));
        }
        info!(archive = %format!("{dir}.tar.gz"), "Archive packed again");
        Ok(())
    }
}
