//! Transfer Engine
//!
//! Moves files between the local job tree and the cluster over a shared
//! [`RemoteChannel`]. Every copy is verified by comparing the local SHA-256
//! digest with `sha256sum` on the remote side; a failed copy and a digest
//! mismatch both consume one attempt of the retry budget.
//!
//! ```text
//!   push_tree ─┬─ ensure each remote directory once (mkdir -p, test -d)
//!              └─ buffer_unordered(concurrency)
//!                    └─ push_file: copy_to ─▶ sha256sum ─▶ compare ─▶ retry?
//! ```
//!
//! Tree operations are best effort: every file gets a [`TransferOutcome`] in
//! the [`TransferReport`], and only directory-level problems abort the call.
//! A dropped ssh session counts as one failed attempt here; the queue poll
//! loop does not retry it.

pub mod digest;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::TransferConfig;
use crate::remote::{shell, RemoteChannel};
use crate::types::{StageError, StageResult};
use crate::utils::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Push,
    Pull,
}

/// Result of one file transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub local: PathBuf,
    pub remote: String,
    pub direction: Direction,
    /// Attempts used; zero when the file was never tried
    pub attempts: u32,
    /// Verified digest, or the terminal error
    pub result: Result<String, String>,
}

impl TransferOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn digest(&self) -> Option<&str> {
        self.result.as_ref().ok().map(String::as_str)
    }

    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().err().map(String::as_str)
    }
}

/// Per-file outcomes of a batch transfer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferReport {
    pub outcomes: Vec<TransferOutcome>,
}

impl TransferReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> Vec<&TransferOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(TransferOutcome::is_ok)
    }

    pub fn merge(&mut self, other: TransferReport) {
        self.outcomes.extend(other.outcomes);
    }

    pub fn summary(&self) -> String {
        let retried = self.outcomes.iter().filter(|o| o.attempts > 1).count();
        format!(
            "{} transferred, {} failed, {} needed retries",
            self.succeeded(),
            self.outcomes.len() - self.succeeded(),
            retried
        )
    }
}

/// Which remote files a selective pull takes
#[derive(Debug, Clone, PartialEq)]
pub enum FileFilter {
    All,
    /// File names ending in this extension, e.g. `.cosmo`
    Extension(String),
}

impl FileFilter {
    pub fn from_extension(extension: Option<&str>) -> Self {
        match extension.map(str::trim) {
            Some(ext) if !ext.is_empty() => {
                let ext = if ext.starts_with('.') {
                    ext.to_string()
                } else {
                    format!(".{ext}")
                };
                FileFilter::Extension(ext)
            }
            _ => FileFilter::All,
        }
    }

    pub fn accepts(&self, file_name: &str) -> bool {
        match self {
            FileFilter::All => true,
            FileFilter::Extension(ext) => file_name.ends_with(ext.as_str()),
        }
    }
}

/// Bounded-concurrency, retried and verified file transfer over one channel
#[derive(Clone)]
pub struct TransferEngine {
    channel: Arc<dyn RemoteChannel>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl TransferEngine {
    pub fn new(channel: Arc<dyn RemoteChannel>, config: &TransferConfig) -> Self {
        Self {
            channel,
            policy: config.retry_policy(),
            concurrency: config.concurrency.max(1),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// `mkdir -p` followed by `test -d`; whether the directory exists afterwards
    pub async fn ensure_remote_dir(&self, dir: &str) -> StageResult<bool> {
        let outcome = retry_with_backoff(&self.policy, retry_transfer, |_| async move {
            let created = self.channel.exec(&shell::mkdir_p(dir)).await?;
            if !created.success() {
                debug!(dir = %dir, stderr = %created.stderr.trim(), "mkdir -p reported failure");
            }
            Ok::<_, StageError>(self.channel.exec(&shell::test_dir(dir)).await?.success())
        })
        .await;
        outcome.result
    }

    /// Create `dir` if needed and delete everything inside it
    pub async fn clear_remote_dir(&self, dir: &str) -> StageResult<()> {
        if !self.ensure_remote_dir(dir).await? {
            return Err(StageError::RemoteState(format!(
                "remote directory {dir} does not exist"
            )));
        }
        let outcome = retry_with_backoff(&self.policy, retry_transfer, |_| async move {
            self.channel.exec(&shell::clear_dir(dir)).await?.require_success()
        })
        .await;
        outcome.result?;
        info!(dir = %dir, "Cleared remote directory");
        Ok(())
    }

    async fn remote_digest(&self, remote: &str) -> StageResult<String> {
        let result = self.channel.exec(&shell::sha256sum(remote)).await?;
        if !result.success() {
            return Err(StageError::Transient(format!(
                "sha256sum {} exited with {}",
                remote, result.exit_code
            )));
        }
        digest::parse_sha256sum(&result.stdout)
            .ok_or_else(|| StageError::Transient(format!("unreadable digest for {remote}")))
    }

    /// Copy one file to the cluster and verify it, retrying per the engine's policy
    pub async fn push_file(&self, local: &Path, remote: &str) -> TransferOutcome {
        self.push_file_with(local, remote, &self.policy).await
    }

    pub async fn push_file_with(
        &self,
        local: &Path,
        remote: &str,
        policy: &RetryPolicy,
    ) -> TransferOutcome {
        let outcome = retry_with_backoff(policy, retry_transfer, |attempt| async move {
            self.channel.copy_to(local, remote).await.map_err(|e| {
                warn!(local = %local.display(), remote = %remote, attempt, error = %e, "Push failed");
                e
            })?;
            let expected = digest::local_sha256(local).await?;
            let actual = self.remote_digest(remote).await?;
            digest::verify(expected, actual)
        })
        .await;

        finish(local, remote, Direction::Push, outcome.attempts, outcome.result)
    }

    /// Push in-memory content (scripts) through a local staging file
    pub async fn push_content(&self, content: &[u8], remote: &str) -> TransferOutcome {
        let staged = tempfile::NamedTempFile::new().and_then(|mut file| {
            file.write_all(content)?;
            file.flush()?;
            Ok(file)
        });
        match staged {
            Ok(file) => self.push_file(file.path(), remote).await,
            Err(e) => finish(
                Path::new("<memory>"),
                remote,
                Direction::Push,
                0,
                Err(StageError::Io(e)),
            ),
        }
    }

    /// Push every file under `local_dir` to the same relative path under
    /// `remote_dir`. Each distinct remote directory is ensured once; files
    /// whose directory cannot be created fail without a copy attempt.
    pub async fn push_tree(&self, local_dir: &Path, remote_dir: &str) -> StageResult<TransferReport> {
        let mut files = Vec::new();
        for entry in WalkDir::new(local_dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(local_dir)
                .map_err(|e| StageError::Parse(e.to_string()))?;
            let relative: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            files.push((entry.path().to_path_buf(), shell::join(remote_dir, &relative.join("/"))));
        }

        if files.is_empty() {
            return Err(StageError::EmptyInput(format!(
                "no files under {}",
                local_dir.display()
            )));
        }

        let dirs: BTreeSet<String> = files.iter().map(|(_, remote)| shell::parent(remote)).collect();
        let mut dir_ok = BTreeMap::new();
        for dir in dirs {
            let exists = self.ensure_remote_dir(&dir).await?;
            if !exists {
                warn!(dir = %dir, "Remote directory could not be created");
            }
            dir_ok.insert(dir, exists);
        }

        let mut report = TransferReport::default();
        let mut ready = Vec::new();
        for (local, remote) in files {
            if dir_ok.get(&shell::parent(&remote)).copied().unwrap_or(false) {
                ready.push((local, remote));
            } else {
                let err = StageError::RemoteState(format!(
                    "remote directory {} does not exist",
                    shell::parent(&remote)
                ));
                report
                    .outcomes
                    .push(finish(&local, &remote, Direction::Push, 0, Err(err)));
            }
        }

        let outcomes: Vec<TransferOutcome> = stream::iter(ready)
            .map(|(local, remote)| async move { self.push_file(&local, &remote).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        report.outcomes.extend(outcomes);

        info!(local = %local_dir.display(), remote = %remote_dir, summary = %report.summary(), "Push finished");
        Ok(report)
    }

    /// Copy one file from the cluster and verify it
    pub async fn pull_file(&self, remote: &str, local: &Path) -> TransferOutcome {
        if let Some(parent) = local.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return finish(local, remote, Direction::Pull, 0, Err(e.into()));
            }
        }

        let outcome = retry_with_backoff(&self.policy, retry_transfer, |attempt| async move {
            self.channel.copy_from(remote, local).await.map_err(|e| {
                warn!(remote = %remote, local = %local.display(), attempt, error = %e, "Pull failed");
                e
            })?;
            let expected = self.remote_digest(remote).await?;
            let actual = digest::local_sha256(local).await?;
            digest::verify(expected, actual)
        })
        .await;

        finish(local, remote, Direction::Pull, outcome.attempts, outcome.result)
    }

    /// Pull the files under `remote_dir` accepted by `filter` (and not named
    /// in `exclude`) into the same relative layout under `local_dir`
    pub async fn pull_selective(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        filter: &FileFilter,
        exclude: &[String],
    ) -> StageResult<TransferReport> {
        let listing = self.channel.exec(&shell::find_files(remote_dir)).await?;
        if !listing.success() {
            return Err(StageError::RemoteState(format!(
                "cannot list {}: {}",
                remote_dir,
                listing.stderr.trim()
            )));
        }

        let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
        let wanted: Vec<(String, PathBuf)> = listing
            .lines()
            .filter_map(|path| {
                let relative = path.strip_prefix(&prefix)?;
                let name = relative.rsplit('/').next().unwrap_or(relative);
                if exclude.iter().any(|e| e == name) || !filter.accepts(name) {
                    return None;
                }
                let local = relative
                    .split('/')
                    .fold(local_dir.to_path_buf(), |acc, part| acc.join(part));
                Some((path.to_string(), local))
            })
            .collect();

        debug!(remote = %remote_dir, files = wanted.len(), "Selected files to pull");

        let outcomes: Vec<TransferOutcome> = stream::iter(wanted)
            .map(|(remote, local)| async move { self.pull_file(&remote, &local).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        let report = TransferReport { outcomes };

        info!(remote = %remote_dir, local = %local_dir.display(), summary = %report.summary(), "Pull finished");
        Ok(report)
    }
}

/// Copies also retry a lost ssh session
fn retry_transfer(error: &StageError) -> bool {
    error.is_retryable() || matches!(error, StageError::Channel(_))
}

fn finish(
    local: &Path,
    remote: &str,
    direction: Direction,
    attempts: u32,
    result: StageResult<String>,
) -> TransferOutcome {
    if let Err(e) = &result {
        warn!(local = %local.display(), remote = %remote, attempts, error = %e, "Transfer gave up");
    }
    TransferOutcome {
        local: local.to_path_buf(),
        remote: remote.to_string(),
        direction,
        attempts,
        result: result.map_err(|e| e.to_string()),
    }
}
