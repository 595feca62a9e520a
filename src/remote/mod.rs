//! Remote Channel Abstraction
//!
//! Everything the orchestration core does on the cluster goes through one of
//! three primitives: run a shell command, copy a file to the host, copy a file
//! from the host.
//!
//! ```text
//! ┌──────────────────┐                      ┌──────────────────┐
//! │  TransferEngine  │──copy_to/copy_from──▶│                  │
//! │  ScriptRunner    │                      │  Cluster login   │
//! │  QueueMonitor    │───────exec──────────▶│  node (sh, qstat │
//! │  ResultCollector │◀──CommandResult──────│  tar, sha256sum) │
//! └──────────────────┘                      └──────────────────┘
//! ```

pub mod openssh;
pub mod shell;

#[cfg(test)]
pub mod fake;

pub use openssh::OpenSshChannel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{StageError, StageResult};

/// Remote shell plus secure file copy
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Run a command through the remote shell. A non-zero exit status is
    /// returned in the result, not as an error.
    async fn exec(&self, command: &str) -> StageResult<CommandResult>;

    async fn copy_to(&self, local: &Path, remote: &str) -> StageResult<()>;

    async fn copy_from(&self, remote: &str, local: &Path) -> StageResult<()>;
}

/// Result of command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// The command that was executed
    pub command: String,

    pub stdout: String,

    pub stderr: String,

    /// Exit code (0 = success)
    pub exit_code: i32,

    /// Execution duration in milliseconds
    pub duration_ms: u64,
}

impl CommandResult {
    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Turn a non-zero exit into a remote state error carrying stderr
    pub fn require_success(self) -> StageResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(StageError::RemoteState(format!(
                "`{}` exited with {}: {}",
                self.command,
                self.exit_code,
                self.stderr.trim()
            )))
        }
    }

    /// Non-empty trimmed stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}
