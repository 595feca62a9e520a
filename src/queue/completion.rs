//! Actions run once after the queue drains.
//!
//! ```text
//! cleanup ─▶ archive copy ─▶ gzip ─▶ delete temp contents
//! ```
//!
//! Each step has its own flag and may be skipped; the order never changes.
//! Gzip only runs when the archive copy ran in the same chain. A failing step
//! stops the chain so that nothing is deleted before it has been archived.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{CompletionConfig, PathsConfig};
use crate::remote::{shell, RemoteChannel};
use crate::types::{StageError, StageResult};

pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStep {
    Cleanup,
    ArchiveCopy,
    Gzip,
    DeleteTempContents,
}

impl fmt::Display for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainStep::Cleanup => "cleanup",
            ChainStep::ArchiveCopy => "archive copy",
            ChainStep::Gzip => "gzip",
            ChainStep::DeleteTempContents => "delete temp contents",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainReport {
    pub executed: Vec<ChainStep>,
    pub skipped: Vec<ChainStep>,
    /// Remote path of the archive folder (or `.tar.gz`) created by this chain
    pub archive: Option<String>,
}

/// Flag-gated post-drain actions. `run` consumes the chain, so one chain
/// executes at most once.
pub struct CompletionChain {
    channel: Arc<dyn RemoteChannel>,
    paths: PathsConfig,
    config: CompletionConfig,
}

impl CompletionChain {
    pub fn new(channel: Arc<dyn RemoteChannel>, paths: &PathsConfig, config: &CompletionConfig) -> Self {
        Self {
            channel,
            paths: paths.clone(),
            config: config.clone(),
        }
    }

    pub fn archive_name(&self, now: NaiveDateTime) -> String {
        format!("{}_{}", self.paths.list_folder_name, now.format(TIMESTAMP_FORMAT))
    }

    pub async fn run(self) -> StageResult<ChainReport> {
        self.run_at(chrono::Local::now().naive_local()).await
    }

    pub async fn run_at(self, now: NaiveDateTime) -> StageResult<ChainReport> {
        let temp = self.paths.remote_temp_dir();
        let mut report = ChainReport::default();

        if self.config.cleanup_temp_dir {
            let patterns: Vec<String> = self.config.keep_pattern.iter().cloned().collect();
            self.step(
                ChainStep::Cleanup,
                &shell::prune_files(&temp, &self.config.keep_files, &patterns),
            )
            .await?;
            report.executed.push(ChainStep::Cleanup);
        } else {
            report.skipped.push(ChainStep::Cleanup);
        }

        let mut archived = None;
        if self.config.copy_to_timestamped_folder {
            let folder = shell::join(&self.paths.remote_root(), &self.archive_name(now));
            let command = format!(
                "{} && {}",
                shell::mkdir_p(&folder),
                shell::copy_contents(&temp, &folder)
            );
            self.step(ChainStep::ArchiveCopy, &command).await?;

            let listing = self.channel.exec(&shell::list_dir(&folder)).await?;
            if listing.lines().next().is_none() {
                return Err(StageError::RemoteState(format!(
                    "archive folder {folder} is empty after copy"
                )));
            }
            report.executed.push(ChainStep::ArchiveCopy);
            archived = Some(folder);
        } else {
            report.skipped.push(ChainStep::ArchiveCopy);
        }

        match (&archived, self.config.gzip_timestamped_folder) {
            (Some(folder), true) => {
                self.step(ChainStep::Gzip, &shell::gzip_dir(folder)).await?;
                report.executed.push(ChainStep::Gzip);
                archived = Some(format!("{folder}.tar.gz"));
            }
            _ => report.skipped.push(ChainStep::Gzip),
        }

        if self.config.delete_temp_dir_contents {
            self.step(ChainStep::DeleteTempContents, &shell::clear_dir(&temp))
                .await?;
            report.executed.push(ChainStep::DeleteTempContents);
        } else {
            report.skipped.push(ChainStep::DeleteTempContents);
        }

        report.archive = archived;
        info!(
            executed = ?report.executed,
            skipped = ?report.skipped,
            archive = ?report.archive,
            "Completion chain finished"
        );
        Ok(report)
    }

    async fn step(&self, step: ChainStep, command: &str) -> StageResult<()> {
        let result = self.channel.exec(command).await?;
        if !result.success() {
            warn!(%step, exit_code = result.exit_code, "Completion step failed");
            return Err(StageError::RemoteState(format!(
                "{step} failed ({}): {}",
                result.exit_code,
                result.combined_output().trim()
            )));
        }
        info!(%step, "Completion step done");
        Ok(())
    }
}
