//! Queue Monitor
//!
//! Submission of prepared jobs, scheduler polling until the batch drains,
//! and the completion chain that runs once afterwards.
//!
//! ```text
//!            ┌──────── poll every interval ────────┐
//!            ▼                                     │
//!   ┌─────────────────┐  status lines present  ┌───┴─────┐
//!   │ status command  │───────────────────────▶│ Polling │
//!   └─────────────────┘                        └─────────┘
//!            │ no job lines
//!            ▼
//!   ┌─────────────────┐        ┌──────────────────┐
//!   │     Drained     │───────▶│ CompletionChain  │ (once)
//!   └─────────────────┘        └──────────────────┘
//! ```
//!
//! The loop does not reconnect: a channel error during a poll ends it and
//! is returned to the caller.

pub mod completion;
pub mod submit;

pub use completion::{ChainReport, ChainStep, CompletionChain};
pub use submit::{SubmitOutcome, Submitter};

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::models::JobState;
use crate::remote::RemoteChannel;
use crate::types::{StageError, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Polling,
    Drained,
}

/// Totals of a finished wait
#[derive(Debug, Clone, Serialize)]
pub struct DrainSummary {
    pub polls: u32,
    pub elapsed_secs: u64,
}

/// Extract the state column of every job line, skipping the header
pub fn parse_states(stdout: &str, header_lines: usize, column: usize) -> Vec<JobState> {
    stdout
        .lines()
        .skip(header_lines)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_whitespace().nth(column))
        .map(JobState::from_token)
        .collect()
}

/// State → count, e.g. `{"queued": 3, "running": 2}`
pub fn summarize(states: &[JobState]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for state in states {
        *counts.entry(state.to_string()).or_insert(0) += 1;
    }
    counts
}

pub struct QueueMonitor {
    channel: Arc<dyn RemoteChannel>,
    config: QueueConfig,
}

impl QueueMonitor {
    pub fn new(channel: Arc<dyn RemoteChannel>, config: &QueueConfig) -> Self {
        Self {
            channel,
            config: config.clone(),
        }
    }

    /// One status query
    pub async fn poll(&self) -> StageResult<Vec<JobState>> {
        let output = self.channel.exec(&self.config.status_command).await?;
        if !output.success() {
            return Err(StageError::Channel(format!(
                "{} exited with {}: {}",
                self.config.status_command,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(parse_states(
            &output.stdout,
            self.config.header_lines,
            self.config.state_column,
        ))
    }

    pub async fn state(&self) -> StageResult<(MonitorState, Vec<JobState>)> {
        let states = self.poll().await?;
        let state = if states.is_empty() {
            MonitorState::Drained
        } else {
            MonitorState::Polling
        };
        Ok((state, states))
    }

    /// Poll until no job is listed any more, sleeping the configured interval
    /// between polls
    pub async fn wait_until_drained(&self) -> StageResult<DrainSummary> {
        let started = Instant::now();
        let mut polls = 0;

        loop {
            polls += 1;
            let (state, states) = self.state().await?;
            let elapsed_minutes = started.elapsed().as_secs() / 60;

            match state {
                MonitorState::Drained => {
                    info!(polls, elapsed_minutes, "Queue drained");
                    return Ok(DrainSummary {
                        polls,
                        elapsed_secs: started.elapsed().as_secs(),
                    });
                }
                MonitorState::Polling => {
                    let counts = summarize(&states);
                    info!(
                        jobs = states.len(),
                        states = ?counts,
                        elapsed_minutes,
                        "Jobs still in queue"
                    );
                    debug!(interval_secs = self.config.poll_interval_secs, "Sleeping until next poll");
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
    }

    /// Wait for the drain, then run the chain exactly once
    pub async fn drain_then(&self, chain: CompletionChain) -> StageResult<(DrainSummary, ChainReport)> {
        let summary = self.wait_until_drained().await?;
        let report = chain.run().await?;
        Ok((summary, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompletionConfig, PathsConfig};
    use crate::remote::fake::FakeChannel;

    const QSTAT: &str = "job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID\n\
-----------------------------------------------------------------------------------------------------------------\n\
 101 0.55500 PFOA_1     chem         r     06/01/2024 10:00:00 speedy@compute-0-1.local          10\n\
 102 0.55500 PFOA_2     chem         qw    06/01/2024 10:00:01                                   10\n\
 103 0.55500 PFOA_3     chem         qw    06/01/2024 10:00:02                                   10\n";

    fn config() -> QueueConfig {
        QueueConfig {
            poll_interval_secs: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_states() {
        let states = parse_states(QSTAT, 2, 4);
        assert_eq!(
            states,
            vec![JobState::Running, JobState::Queued, JobState::Queued]
        );
        let counts = summarize(&states);
        assert_eq!(counts["queued"], 2);
        assert_eq!(counts["running"], 1);
        assert!(parse_states("", 2, 4).is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_drained_polls_until_empty() {
        let fake = Arc::new(FakeChannel::new());
        fake.script("qstat", 0, QSTAT);
        fake.script("qstat", 0, QSTAT);
        fake.script("qstat", 0, "");
        let monitor = QueueMonitor::new(fake.clone(), &config());

        let summary = monitor.wait_until_drained().await.unwrap();
        assert_eq!(summary.polls, 3);
        assert_eq!(fake.history().len(), 3);
    }

    #[tokio::test]
    async fn test_channel_error_halts_the_loop() {
        let fake = Arc::new(FakeChannel::new());
        fake.script("qstat", 0, QSTAT);
        fake.script_channel_error("qstat", "connection reset");
        let monitor = QueueMonitor::new(fake.clone(), &config());

        let err = monitor.wait_until_drained().await.unwrap_err();
        assert!(matches!(err, StageError::Channel(_)));
        assert_eq!(fake.history().len(), 2);
    }

    #[tokio::test]
    async fn test_chain_runs_once_after_drain() {
        let fake = Arc::new(FakeChannel::new());
        fake.put_file("/r/temp/PFOA_1/PFOA_1.cosmo", b"cosmo");
        fake.script("qstat", 0, QSTAT);
        fake.script("qstat", 0, "");
        let paths = PathsConfig {
            remote_directory: "/r".to_string(),
            temp_dir: "temp".to_string(),
            list_folder_name: "PFOA".to_string(),
            ..Default::default()
        };
        let chain = CompletionChain::new(fake.clone(), &paths, &CompletionConfig::default());
        let monitor = QueueMonitor::new(fake.clone(), &config());

        let (summary, report) = monitor.drain_then(chain).await.unwrap();
        assert_eq!(summary.polls, 2);
        assert_eq!(report.executed, vec![ChainStep::ArchiveCopy]);

        let history = fake.history();
        let last_poll = history.iter().rposition(|c| c == "qstat").unwrap();
        let copies: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, c)| c.contains("cp -r"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(copies[0] > last_poll);
    }
}
