//! Remote channel backed by the system OpenSSH client.
//!
//! Each `exec`/`copy_*` call opens its own `ssh`/`scp` process. Process
//! start-up is serialized behind a mutex and a semaphore bounds how many
//! channels are open at once; the transfers themselves run concurrently.

use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, trace};

use super::{shell, CommandResult, RemoteChannel};
use crate::config::ClusterConfig;
use crate::types::{StageError, StageResult};

/// ssh reserves this exit status for its own connection failures
const SSH_FAILURE_EXIT: i32 = 255;

pub struct OpenSshChannel {
    config: ClusterConfig,
    sessions: Arc<Semaphore>,
    spawn_lock: Mutex<()>,
}

impl OpenSshChannel {
    pub fn new(config: &ClusterConfig) -> StageResult<Self> {
        if config.host.trim().is_empty() {
            return Err(StageError::Config("cluster.host is not set".to_string()));
        }
        if config.user.trim().is_empty() {
            return Err(StageError::Config("cluster.user is not set".to_string()));
        }
        Ok(Self {
            config: config.clone(),
            sessions: Arc::new(Semaphore::new(config.max_sessions.max(1))),
            spawn_lock: Mutex::new(()),
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    /// `user@host:path` operand for scp
    fn remote_operand(&self, remote: &str) -> String {
        if self.config.scp_legacy_protocol {
            format!("{}:{}", self.destination(), shell::quote(remote))
        } else {
            format!("{}:{}", self.destination(), remote)
        }
    }

    /// Options shared by ssh and scp; only the port flag differs
    fn options(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            port_flag.to_string(),
            self.config.port.to_string(),
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for option in &self.config.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    async fn run(&self, mut command: Command) -> StageResult<Output> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|e| StageError::Channel(format!("session pool closed: {e}")))?;

        let child = {
            let _guard = self.spawn_lock.lock().await;
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?
        };

        Ok(child.wait_with_output().await?)
    }

    async fn scp(&self, from: String, to: String) -> StageResult<()> {
        let mut command = Command::new(&self.config.scp_program);
        command.args(self.options("-P")).arg("-q");
        if self.config.scp_legacy_protocol {
            command.arg("-O");
        }
        command.arg(&from).arg(&to);

        let output = self.run(command).await?;
        if output.status.success() {
            trace!(from = %from, to = %to, "scp complete");
            Ok(())
        } else {
            Err(StageError::Transient(format!(
                "scp {} -> {} failed: {}",
                from,
                to,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl RemoteChannel for OpenSshChannel {
    async fn exec(&self, command: &str) -> StageResult<CommandResult> {
        let start = Instant::now();
        let mut ssh = Command::new(&self.config.ssh_program);
        ssh.args(self.options("-p"))
            .arg(self.destination())
            .arg("--")
            .arg(command);

        let output = self.run(ssh).await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if exit_code == SSH_FAILURE_EXIT {
            return Err(StageError::Channel(format!(
                "ssh to {} failed: {}",
                self.config.host,
                stderr.trim()
            )));
        }

        let result = CommandResult {
            command: command.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(command = %command, exit_code, duration_ms = result.duration_ms, "Remote command finished");
        Ok(result)
    }

    async fn copy_to(&self, local: &Path, remote: &str) -> StageResult<()> {
        self.scp(
            local.display().to_string(),
            self.remote_operand(remote),
        )
        .await
    }

    async fn copy_from(&self, remote: &str, local: &Path) -> StageResult<()> {
        self.scp(
            self.remote_operand(remote),
            local.display().to_string(),
        )
        .await
    }
}
